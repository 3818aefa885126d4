//! Deterministic names for child objects.
//!
//! A child's name is the normalized key plus a short hash of the parent's
//! name, so two parents with similar names never collide and every name fits
//! the 63 character limit of the object store.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

pub const MAX_NAME_LEN: usize = 63;

const HASH_LEN: usize = 8;

fn invalid_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9-]+").expect("static pattern is valid"))
}

/// Lowercase, map runs of disallowed characters to `-` and trim dashes.
pub fn normalize(key: &str) -> String {
    let lowered = key.to_lowercase();
    invalid_chars()
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string()
}

/// First eight hex characters of the SHA-256 of `data`.
pub fn short_hash(data: &str) -> String {
    let digest = hex::encode(Sha256::digest(data.as_bytes()));
    digest[..HASH_LEN].to_string()
}

/// `{normalize(key)}-{short_hash(parent)}`, truncated to [`MAX_NAME_LEN`].
pub fn child_name(key: &str, parent: &str) -> String {
    let suffix = short_hash(parent);
    let mut base = normalize(key);
    let max_base = MAX_NAME_LEN - HASH_LEN - 1;
    if base.len() > max_base {
        base.truncate(max_base);
        base = base.trim_end_matches('-').to_string();
    }
    if base.is_empty() {
        suffix
    } else {
        format!("{base}-{suffix}")
    }
}
