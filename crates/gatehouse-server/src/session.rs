//! Cookie-keyed session store.
//!
//! Records live in a [`DashMap`] keyed by a random session id that the
//! browser carries in a cookie. A record is dropped once it has gone unused
//! for the configured idle timeout, either lazily on lookup or by the
//! periodic sweep started with [`SessionStore::spawn_sweeper`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use gatehouse_auth::nonce::{NonceSource, is_nonce_token};
use gatehouse_auth::{Session, SessionError};
use tokio::task::JoinHandle;

/// Length of a session id.
pub const SESSION_ID_LENGTH: usize = 32;

struct SessionRecord {
    values: HashMap<String, serde_json::Value>,
    last_seen: Instant,
}

impl SessionRecord {
    fn new() -> Self {
        Self {
            values: HashMap::new(),
            last_seen: Instant::now(),
        }
    }
}

/// In-memory session records shared by all requests.
pub struct SessionStore {
    records: DashMap<String, SessionRecord>,
    idle_timeout: Duration,
    nonces: Arc<dyn NonceSource>,
    evictions: AtomicU64,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration, nonces: Arc<dyn NonceSource>) -> Self {
        Self {
            records: DashMap::new(),
            idle_timeout,
            nonces,
            evictions: AtomicU64::new(0),
        }
    }

    /// Opens the session named by the request cookie, or a fresh one.
    ///
    /// Unknown, malformed and idle-expired ids are replaced by a newly
    /// generated id. Nothing is stored until the handle is first written.
    pub fn open(self: &Arc<Self>, cookie_value: Option<&str>) -> SessionHandle {
        if let Some(id) = cookie_value.filter(|id| is_session_id(id)) {
            let live = match self.records.get_mut(id) {
                Some(mut record) if record.last_seen.elapsed() < self.idle_timeout => {
                    record.last_seen = Instant::now();
                    true
                }
                Some(record) => {
                    drop(record);
                    self.evict(id);
                    false
                }
                None => false,
            };
            if live {
                return SessionHandle {
                    store: Arc::clone(self),
                    id: Mutex::new(id.to_string()),
                    is_new: AtomicBool::new(false),
                };
            }
        }

        SessionHandle {
            store: Arc::clone(self),
            id: Mutex::new(self.nonces.generate(SESSION_ID_LENGTH)),
            is_new: AtomicBool::new(true),
        }
    }

    /// Removes every record idle for longer than the timeout.
    /// Returns the number of records removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0;

        self.records.retain(|_, record| {
            if record.last_seen.elapsed() >= self.idle_timeout {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        }

        removed
    }

    /// Runs [`cleanup_expired`](Self::cleanup_expired) every `interval`
    /// until the returned task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = store.cleanup_expired();
                if removed > 0 {
                    tracing::debug!(removed, remaining = store.len(), "Swept idle sessions");
                }
            }
        })
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total records dropped for idleness since startup.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn evict(&self, id: &str) {
        if self.records.remove(id).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn is_session_id(value: &str) -> bool {
    value.len() == SESSION_ID_LENGTH && is_nonce_token(value)
}

/// One request's view of a session record.
///
/// The id can change mid-request when the record is regenerated at login.
pub struct SessionHandle {
    store: Arc<SessionStore>,
    id: Mutex<String>,
    is_new: AtomicBool,
}

impl SessionHandle {
    /// The id the browser should carry after this request.
    pub fn id(&self) -> String {
        self.current_id().unwrap_or_default()
    }

    /// `true` when the browser does not hold the current id yet and the
    /// record has been written, so a `Set-Cookie` must be sent.
    pub fn needs_cookie(&self) -> bool {
        self.is_new.load(Ordering::Relaxed)
            && self
                .current_id()
                .is_ok_and(|id| self.store.records.contains_key(&id))
    }

    fn current_id(&self) -> Result<String, SessionError> {
        self.id
            .lock()
            .map(|id| id.clone())
            .map_err(|_| SessionError::unavailable("session handle lock poisoned"))
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("is_new", &self.is_new.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Session for SessionHandle {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, SessionError> {
        let id = self.current_id()?;
        Ok(self
            .store
            .records
            .get(&id)
            .and_then(|record| record.values.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), SessionError> {
        let id = self.current_id()?;
        let mut record = self
            .store
            .records
            .entry(id)
            .or_insert_with(SessionRecord::new);
        record.last_seen = Instant::now();
        record.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SessionError> {
        let id = self.current_id()?;
        if let Some(mut record) = self.store.records.get_mut(&id) {
            record.values.remove(key);
        }
        Ok(())
    }

    async fn regenerate(&self) -> Result<(), SessionError> {
        let fresh = self.store.nonces.generate(SESSION_ID_LENGTH);
        let mut id = self
            .id
            .lock()
            .map_err(|_| SessionError::unavailable("session handle lock poisoned"))?;

        if let Some((_, mut record)) = self.store.records.remove(id.as_str()) {
            record.last_seen = Instant::now();
            self.store.records.insert(fresh.clone(), record);
        }
        *id = fresh;
        self.is_new.store(true, Ordering::Relaxed);
        Ok(())
    }
}
