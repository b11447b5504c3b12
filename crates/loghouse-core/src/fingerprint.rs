//! Log Fingerprint Engine
//!
//! Turns a raw log message into a stable `(hash, pattern)` pair so that
//! structurally identical lines collapse into one group.
//!
//! ## Algorithm
//!
//! Variable tokens are replaced with placeholders, in this order:
//!
//! 1. UUID-shaped tokens → `<UUID>`
//! 2. Dotted-quad IP tokens → `<IP>`
//! 3. `0x`-prefixed hex tokens → `<HEX>`
//! 4. Any remaining run of decimal digits → `<NUM>`
//!
//! The digit run goes last on purpose: UUIDs and IPs contain digits, and the
//! generic rule would shred them before the specific rules could match. The
//! normalized pattern is truncated to [`MAX_PATTERN_LEN`] characters (cut,
//! not hashed, so messages sharing a long prefix still dedupe), then hashed
//! with SHA-256. The fingerprint is the 64-hex-char digest.
//!
//! Pure and deterministic: same message, same output, across calls and
//! process restarts. Only log items are fingerprinted - events never are.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Patterns longer than this are cut before hashing.
pub const MAX_PATTERN_LEN: usize = 1000;

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("valid uuid regex")
});
static IP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}\b").expect("valid ip regex"));
static HEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b0x[0-9a-fA-F]+\b").expect("valid hex regex"));
static NUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid number regex"));

/// A stable hash plus the normalized pattern that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// 64 lowercase hex characters (SHA-256 of the pattern).
    pub hash: String,
    /// The placeholder template, at most [`MAX_PATTERN_LEN`] characters.
    pub pattern: String,
}

/// Fingerprint a raw log message.
///
/// Empty input is well-defined: the pattern is empty and the hash is the
/// digest of the empty string.
pub fn fingerprint(message: &str) -> Fingerprint {
    let pattern = normalize(message);
    let mut hasher = Sha256::new();
    hasher.update(pattern.as_bytes());
    let hash = hex::encode(hasher.finalize());
    Fingerprint { hash, pattern }
}

/// Replace variable tokens with placeholders and truncate.
fn normalize(message: &str) -> String {
    let pattern = UUID_RE.replace_all(message, "<UUID>");
    let pattern = IP_RE.replace_all(&pattern, "<IP>");
    let pattern = HEX_RE.replace_all(&pattern, "<HEX>");
    let pattern = NUM_RE.replace_all(&pattern, "<NUM>");
    truncate_chars(&pattern, MAX_PATTERN_LEN)
}

/// Truncate to `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
