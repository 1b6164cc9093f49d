//! Session access.
//!
//! The gateway never talks to a concrete session backend. It receives a
//! per-request [`Session`] handle exposing three operations on named JSON
//! values. Writes are last-write-wins; concurrent requests for one session
//! are not serialised.
//!
//! # Implementation Notes
//!
//! Implementations should:
//!
//! - Return [`SessionError`] only when the backend itself is unreachable;
//!   a missing key is `Ok(None)`
//! - Make `delete` of an absent key a no-op

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors raised by a session backend.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The backend could not be read or written.
    #[error("Session storage unavailable: {0}")]
    Unavailable(String),

    /// A value could not be encoded for storage.
    #[error("Failed to encode session value for '{key}': {message}")]
    Encode {
        /// The session key being written.
        key: String,
        /// Encoder error message.
        message: String,
    },
}

impl SessionError {
    /// Creates an `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Per-request handle on the client's session record.
#[async_trait]
pub trait Session: Send + Sync {
    /// Reads the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, SessionError>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), SessionError>;

    /// Removes `key`.
    async fn delete(&self, key: &str) -> Result<(), SessionError>;

    /// Moves the record to a fresh identifier, keeping its values.
    ///
    /// The gateway calls this right before it stores a credential. Backends
    /// without a client-visible identifier keep the default no-op.
    async fn regenerate(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Names of the session entries one adapter uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    /// Key of the stored [`Credential`](crate::credential::Credential).
    pub credential: &'static str,
    /// Key of the in-flight [`FederationContext`](crate::federation::FederationContext).
    pub context: &'static str,
}

/// Reads and decodes a typed value.
///
/// A value that no longer decodes (for example, written by an older release)
/// is reported as absent rather than as a session failure.
pub async fn load<T: DeserializeOwned>(
    session: &dyn Session,
    key: &str,
) -> Result<Option<T>, SessionError> {
    let Some(raw) = session.get(key).await? else {
        return Ok(None);
    };

    match serde_json::from_value(raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(key, error = %e, "Discarding undecodable session value");
            Ok(None)
        }
    }
}

/// Encodes and stores a typed value.
pub async fn store<T: Serialize + ?Sized>(
    session: &dyn Session,
    key: &str,
    value: &T,
) -> Result<(), SessionError> {
    let raw = serde_json::to_value(value).map_err(|e| SessionError::Encode {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    session.set(key, raw).await
}

/// Reads a typed value and deletes it, whether or not it decoded.
pub async fn take<T: DeserializeOwned>(
    session: &dyn Session,
    key: &str,
) -> Result<Option<T>, SessionError> {
    let value = load(session, key).await?;
    session.delete(key).await?;
    Ok(value)
}

/// Session held entirely in memory.
///
/// Useful for tests and for embedding the gateway where the host already
/// loads the session record before dispatch.
#[derive(Debug, Default)]
pub struct MemorySession {
    values: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemorySession {
    /// Creates an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session pre-populated with `values`.
    #[must_use]
    pub fn from_values(values: HashMap<String, serde_json::Value>) -> Self {
        Self {
            values: Mutex::new(values),
        }
    }

    /// Returns a copy of the current contents.
    pub fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.values
            .lock()
            .map(|values| values.clone())
            .unwrap_or_default()
    }

    /// Returns `true` if `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values
            .lock()
            .map(|values| values.contains_key(key))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, SessionError> {
        let values = self
            .values
            .lock()
            .map_err(|_| SessionError::unavailable("session lock poisoned"))?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), SessionError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| SessionError::unavailable("session lock poisoned"))?;
        values.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SessionError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| SessionError::unavailable("session lock poisoned"))?;
        values.remove(key);
        Ok(())
    }
}
