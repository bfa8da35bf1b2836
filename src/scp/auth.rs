//! Console authentication with digest-matched credentials.
//!
//! Credentials are stored as SHA-256 digests of a length-prefixed secret,
//! never as plaintext, so a config dump does not leak passwords.  Public
//! keys are matched by digesting the base64 key blob the same way; for a
//! pure identity check that is equivalent to digesting the decoded bytes.
//!
//! Crypto is handled by the `hmac-sha256` crate, which is pure Rust and
//! identical on device and host targets.  Each session carries a token
//! bucket so a misbehaving peer cannot brute-force attempts.

use burster::Limiter;
use core::time::Duration;
use log::warn;

/// Attempts allowed per session before the bucket runs dry.
const AUTH_BURST: usize = 5;

/// Digest a secret with its length prefixed, mirroring how the
/// credential lines were provisioned.
fn digest(secret: &[u8]) -> [u8; 32] {
    let mut hasher = hmac_sha256::Hash::new();
    hasher.update((secret.len() as u32).to_be_bytes());
    hasher.update(secret);
    hasher.finalize()
}

fn digests_equal(a: &[u8; 32], b: &[u8; 32]) -> bool {
    // Constant-time compare.
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Store of provisioned credentials, keyed by user name.
pub struct CredentialStore {
    passwords: Vec<(String, [u8; 32])>,
    pubkeys: Vec<(String, [u8; 32])>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            passwords: Vec::new(),
            pubkeys: Vec::new(),
        }
    }

    /// Provision a password credential for `user`.
    pub fn add_password(&mut self, user: &str, password: &str) {
        self.passwords
            .push((user.to_string(), digest(password.as_bytes())));
    }

    /// Provision an authorized public key for `user`.  `blob` is the
    /// base64 key material from the authorized-keys line.
    pub fn add_pubkey(&mut self, user: &str, blob: &str) {
        self.pubkeys
            .push((user.to_string(), digest(blob.as_bytes())));
    }

    pub fn verify_password(&self, user: &str, password: &str) -> bool {
        let candidate = digest(password.as_bytes());
        self.passwords
            .iter()
            .any(|(u, d)| u == user && digests_equal(d, &candidate))
    }

    pub fn verify_pubkey(&self, user: &str, blob: &str) -> bool {
        let candidate = digest(blob.as_bytes());
        self.pubkeys
            .iter()
            .any(|(u, d)| u == user && digests_equal(d, &candidate))
    }

    pub fn is_empty(&self) -> bool {
        self.passwords.is_empty() && self.pubkeys.is_empty()
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session authentication attempt gate.
pub struct AuthGate {
    limiter: burster::TokenBucket<fn() -> Duration>,
}

impl AuthGate {
    pub fn new() -> Self {
        Self {
            // 1 token per second refill, AUTH_BURST burst capacity.
            limiter: burster::TokenBucket::new_with_time_provider(
                1,
                AUTH_BURST as u64,
                platform_now as fn() -> Duration,
            ),
        }
    }

    /// Consume one attempt token; `false` means the peer is throttled.
    pub fn allow_attempt(&mut self) -> bool {
        let ok = self.limiter.try_consume(1).is_ok();
        if !ok {
            warn!("auth: attempt rate limit exceeded");
        }
        ok
    }
}

impl Default for AuthGate {
    fn default() -> Self {
        Self::new()
    }
}

fn platform_now() -> Duration {
    use std::time::Instant;
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed()
}
