//! Opaque identifiers handed out to clients.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use subtle::ConstantTimeEq;

/// Bytes of entropy behind a polling session id.
const POLL_SID_BYTES: usize = 24;

/// Generate an opaque random token with the given prefix.
pub fn generate_opaque_token(prefix: &str, bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill(&mut buf[..]);
    format!("{}_{}", prefix, URL_SAFE_NO_PAD.encode(&buf))
}

/// Polling session ids double as the bearer of an authenticated session, so
/// they must not be guessable from the connection id.
pub fn generate_poll_sid() -> String {
    generate_opaque_token("poll", POLL_SID_BYTES)
}

/// Compare two secrets without short-circuiting on the first differing byte.
pub fn secrets_match(expected: &str, given: &str) -> bool {
    let (a, b) = (expected.as_bytes(), given.as_bytes());
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_sids_are_prefixed_and_distinct() {
        let a = generate_poll_sid();
        let b = generate_poll_sid();
        assert!(a.starts_with("poll_"));
        assert_eq!(a.len(), "poll_".len() + 32);
        assert_ne!(a, b);
    }

    #[test]
    fn secret_comparison() {
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3cret", "s3cres"));
        assert!(!secrets_match("s3cret", "s3cret-longer"));
        assert!(!secrets_match("s3cret", ""));
        assert!(secrets_match("", ""));
        // Same length, differing only in the last byte.
        assert!(!secrets_match("test-internal-key", "test-internal-kez"));
    }
}
