//! Random token generation.
//!
//! Every random value the gateway hands out (credential ids, the instance
//! audience, CSRF `state`, OIDC `nonce`, session ids) is drawn from a
//! [`NonceSource`]. The production source is [`OsNonceSource`], backed by the
//! operating system CSPRNG. Tests inject a deterministic source instead.
//!
//! # Example
//!
//! ```
//! use gatehouse_auth::nonce::{NonceSource, OsNonceSource};
//!
//! let source = OsNonceSource::new().expect("entropy available");
//! let state = source.generate(11);
//! assert_eq!(state.len(), 11);
//! ```

use rand::rngs::OsRng;
use rand::{Rng, RngCore};

/// Characters tokens are drawn from: `[A-Za-z0-9-_]`.
pub const NONCE_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Length of the per-credential issuance nonce.
pub const CREDENTIAL_NONCE_LENGTH: usize = 22;

/// Length of a generated instance audience.
pub const AUDIENCE_LENGTH: usize = 16;

/// Length of the CSRF `state` value sent to providers.
pub const STATE_LENGTH: usize = 11;

/// Length of the OIDC `nonce` value bound into the ID token.
pub const OIDC_NONCE_LENGTH: usize = 11;

/// Errors raised while setting up a random source.
#[derive(Debug, thiserror::Error)]
pub enum NonceError {
    /// The operating system refused to provide random bytes.
    #[error("Secure entropy source unavailable: {0}")]
    EntropyUnavailable(String),
}

/// A source of random URL-safe tokens.
pub trait NonceSource: Send + Sync {
    /// Returns `length` characters drawn uniformly from [`NONCE_ALPHABET`].
    fn generate(&self, length: usize) -> String;
}

/// Token source backed by the operating system CSPRNG.
#[derive(Debug, Clone, Copy)]
pub struct OsNonceSource {
    _checked: (),
}

impl OsNonceSource {
    /// Creates the source after checking that the OS can actually supply
    /// entropy.
    ///
    /// # Errors
    ///
    /// Returns [`NonceError::EntropyUnavailable`] when the startup read fails.
    /// Callers must treat this as fatal; there is no weaker fallback.
    pub fn new() -> Result<Self, NonceError> {
        let mut sample = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut sample)
            .map_err(|e| NonceError::EntropyUnavailable(e.to_string()))?;
        Ok(Self { _checked: () })
    }
}

impl NonceSource for OsNonceSource {
    fn generate(&self, length: usize) -> String {
        let mut rng = OsRng;
        (0..length)
            .map(|_| char::from(NONCE_ALPHABET[rng.gen_range(0..NONCE_ALPHABET.len())]))
            .collect()
    }
}

/// Returns `true` if every character of `token` belongs to [`NONCE_ALPHABET`].
#[must_use]
pub fn is_nonce_token(token: &str) -> bool {
    token.bytes().all(|b| NONCE_ALPHABET.contains(&b))
}
