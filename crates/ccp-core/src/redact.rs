use sha2::{Digest, Sha256};
use std::path::Path;

/// Hex SHA-256 digest. Hashes are the only persisted form of
/// privacy-sensitive strings unless an unsafe mode is enabled.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn hash_str(value: &str) -> String {
    sha256_hex(value.as_bytes())
}

pub fn hash_path(path: &Path) -> String {
    hash_str(&path.to_string_lossy())
}

/// Hashes an argv by joining with NUL so `["a b"]` and `["a", "b"]`
/// digest differently.
pub fn hash_command(command: &[String]) -> String {
    sha256_hex(command.join("\0").as_bytes())
}
