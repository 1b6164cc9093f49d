//! Local identity credentials.
//!
//! A [`Credential`] records who authenticated, for which gateway instance and
//! when. It is deliberately unsigned: it lives inside the session record,
//! whose storage layer is responsible for confidentiality and integrity.
//!
//! [`CredentialService`] is the single authority on whether a stored
//! credential still authenticates its session. Validity is re-evaluated on
//! every request so a [`CredentialHooks::is_allowed`] revocation takes effect
//! on the very next request.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::nonce::{AUDIENCE_LENGTH, CREDENTIAL_NONCE_LENGTH, NonceSource};

/// Session-scoped proof that `subject` authenticated against this instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Authenticated username or identifier.
    pub subject: String,

    /// Identifier of the gateway instance that minted the credential.
    pub audience: String,

    /// Issuance time, seconds since the Unix epoch.
    pub issued_at: i64,

    /// Random identifier of this issuance event.
    pub nonce: String,
}

/// Extension points for a server-side allow or deny ledger.
///
/// Both methods have permissive defaults, so an empty `impl` is a valid
/// no-op hook set.
pub trait CredentialHooks: Send + Sync {
    /// Called once for every freshly issued credential.
    fn on_issue(&self, _credential: &Credential) {}

    /// Called on every validity check, after audience and TTL pass.
    fn is_allowed(&self, _credential: &Credential) -> bool {
        true
    }
}

/// Hook set that records nothing and allows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl CredentialHooks for NoopHooks {}

/// Issues and validates [`Credential`]s for one gateway instance.
#[derive(Clone)]
pub struct CredentialService {
    audience: String,
    global_ttl: Option<Duration>,
    nonces: Arc<dyn NonceSource>,
    hooks: Arc<dyn CredentialHooks>,
}

impl CredentialService {
    /// Creates a service for the given audience.
    #[must_use]
    pub fn new(audience: impl Into<String>, nonces: Arc<dyn NonceSource>) -> Self {
        Self {
            audience: audience.into(),
            global_ttl: None,
            nonces,
            hooks: Arc::new(NoopHooks),
        }
    }

    /// Creates a service using the configured audience, or a random one.
    ///
    /// A generated audience changes on every process start, which silently
    /// invalidates every credential issued by a previous run.
    #[must_use]
    pub fn from_app_id(app_id: Option<&str>, nonces: Arc<dyn NonceSource>) -> Self {
        let audience = match app_id {
            Some(id) => id.to_string(),
            None => {
                tracing::warn!(
                    "No app_id configured; generated a random audience. \
                     Credentials will not survive a restart."
                );
                nonces.generate(AUDIENCE_LENGTH)
            }
        };
        Self::new(audience, nonces)
    }

    /// Sets the maximum credential age.
    #[must_use]
    pub fn with_global_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.global_ttl = ttl;
        self
    }

    /// Installs allow/deny hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn CredentialHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Returns the audience this instance mints credentials for.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Returns the configured maximum credential age.
    #[must_use]
    pub fn global_ttl(&self) -> Option<Duration> {
        self.global_ttl
    }

    /// Issues a credential for `subject` at the current time.
    pub fn issue(&self, subject: impl Into<String>) -> Credential {
        self.issue_at(subject, now_unix())
    }

    /// Issues a credential for `subject` with an explicit issuance time.
    pub fn issue_at(&self, subject: impl Into<String>, now: i64) -> Credential {
        let credential = Credential {
            subject: subject.into(),
            audience: self.audience.clone(),
            issued_at: now,
            nonce: self.nonces.generate(CREDENTIAL_NONCE_LENGTH),
        };
        self.hooks.on_issue(&credential);
        tracing::debug!(subject = %credential.subject, "Issued credential");
        credential
    }

    /// Returns `true` if `credential` still authenticates its session.
    #[must_use]
    pub fn is_valid(&self, credential: &Credential) -> bool {
        self.is_valid_at(credential, now_unix())
    }

    /// Validity check against an explicit clock reading.
    ///
    /// The TTL boundary is inclusive: a credential is still valid exactly
    /// `global_ttl` seconds after issuance.
    #[must_use]
    pub fn is_valid_at(&self, credential: &Credential, now: i64) -> bool {
        if credential.audience != self.audience {
            return false;
        }

        if let Some(ttl) = self.global_ttl {
            let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
            if now.saturating_sub(credential.issued_at) > ttl {
                return false;
            }
        }

        self.hooks.is_allowed(credential)
    }
}

impl std::fmt::Debug for CredentialService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialService")
            .field("audience", &self.audience)
            .field("global_ttl", &self.global_ttl)
            .finish_non_exhaustive()
    }
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
