//! Cache keying and integrity digests.
//!
//! The md5 key is an opaque file identifier, never a security boundary;
//! the authoritative integrity check is SHA-256 over the uncompressed
//! artifact bytes.

use md5::{Digest as _, Md5};
use sha2::{Digest as _, Sha256};

use gestvenv_platform::PlatformTag;

/// `md5(name-version-platform)`, hex-encoded.
pub fn cache_key(package: &str, version: &str, platform: &PlatformTag) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{}-{version}-{platform}", package.to_lowercase()));
    hex::encode(hasher.finalize())
}

/// SHA-256 over `data`, hex-encoded.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
