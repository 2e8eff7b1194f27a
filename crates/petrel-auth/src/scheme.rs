//! Password scheme parsing and verification.
//!
//! Stored passwords optionally carry their scheme as a prefix, e.g.
//! `{SHA256}5e88489...`; a bare password is taken as [`DEFAULT_SCHEME`].
//! Digest schemes compare against lowercase or uppercase hex.

use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

/// Scheme assumed when a stored password has no `{SCHEME}` prefix.
pub const DEFAULT_SCHEME: &str = "PLAIN";

/// A stored password names a scheme this build does not support.
#[derive(Error, Debug)]
#[error("unknown password scheme {0}")]
pub struct UnknownScheme(pub String);

/// Splits a stored password into its scheme (if any) and the secret.
///
/// `{PLAIN}pass` → `(Some("PLAIN"), "pass")`; `pass` → `(None, "pass")`.
/// An unterminated `{` is not a scheme prefix, it's part of the secret.
#[must_use]
pub fn split_scheme(stored: &str) -> (Option<&str>, &str) {
    if let Some(rest) = stored.strip_prefix('{') {
        if let Some(end) = rest.find('}') {
            return (Some(&rest[..end]), &rest[end + 1..]);
        }
    }
    (None, stored)
}

/// Verifies a plaintext password against a stored secret under `scheme`.
pub fn verify(scheme: &str, plain: &str, secret: &str) -> Result<bool, UnknownScheme> {
    match scheme.to_ascii_uppercase().as_str() {
        "PLAIN" | "CLEARTEXT" => Ok(constant_time_eq(plain.as_bytes(), secret.as_bytes())),
        "SHA256" => {
            let digest = hex::encode(Sha256::digest(plain.as_bytes()));
            Ok(digest.eq_ignore_ascii_case(secret))
        }
        "SHA512" => {
            let digest = hex::encode(Sha512::digest(plain.as_bytes()));
            Ok(digest.eq_ignore_ascii_case(secret))
        }
        _ => Err(UnknownScheme(scheme.to_string())),
    }
}

/// Length-revealing but content-constant-time comparison; enough to keep
/// plaintext comparison from leaking a prefix match.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
