//! Dedup key derivation for feed entries.
//!
//! The key is `sha256(canonical(identity))` as lowercase hex, where the
//! identity is the entry's guid or, failing that, its link. Absolute
//! `http(s)` identities are canonicalized to `scheme://host[:port]/path`
//! with scheme and host lower-cased, dropping the query string and the
//! fragment, so tracking parameters added between polls do not create
//! new items.

use sha2::{Digest, Sha256};
use url::Url;

/// Canonical form of an identity string.
///
/// Strings that are not absolute `http`/`https` URLs, or fail to parse
/// as one, are only trimmed.
pub fn canonicalize(identity: &str) -> String {
    let trimmed = identity.trim();
    let lower = trimmed.to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return trimmed.to_string();
    }

    match Url::parse(trimmed) {
        Ok(url) => {
            let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
            match url.port() {
                Some(port) => format!("{}://{}:{}{}", url.scheme(), host, port, url.path()),
                None => format!("{}://{}{}", url.scheme(), host, url.path()),
            }
        }
        Err(_) => trimmed.to_string(),
    }
}

/// Derive the fixed-length (64 hex chars) dedup key for an identity.
pub fn dedup_key(identity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(identity).as_bytes());
    hex::encode(hasher.finalize())
}
