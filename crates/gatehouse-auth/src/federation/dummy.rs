//! Development adapter that authenticates every session as one user.

use std::sync::Arc;

use super::{BeginFederation, FederationContext, FederationTarget, VerifiedUsername};
use crate::nonce::{NonceSource, STATE_LENGTH};
use crate::session::SessionKeys;

/// Session keys used by the dummy adapter. The context key is never written.
pub const SESSION_KEYS: SessionKeys = SessionKeys {
    credential: "dummy.auth_info",
    context: "dummy.state",
};

/// Adapter that skips the provider round trip entirely.
pub struct DummyAdapter {
    username: String,
    nonces: Arc<dyn NonceSource>,
}

impl DummyAdapter {
    /// Creates an adapter that always yields `username`.
    #[must_use]
    pub fn new(username: impl Into<String>, nonces: Arc<dyn NonceSource>) -> Self {
        Self {
            username: username.into(),
            nonces,
        }
    }

    pub(crate) fn begin_federation(&self, target: &FederationTarget) -> BeginFederation {
        BeginFederation {
            redirect_target: target.return_to.clone(),
            context: FederationContext {
                return_to: target.return_to.clone(),
                state: self.nonces.generate(STATE_LENGTH),
                nonce: None,
            },
        }
    }

    pub(crate) fn complete_federation(&self) -> VerifiedUsername {
        VerifiedUsername::new(self.username.clone())
    }
}
