//! SHA-256 digests in the two shapes the system stores: plain lowercase hex
//! for the relational store and 0x-prefixed bytes32 for the contract.

use sha2::{Digest, Sha256};

/// All-zero bytes32, submitted when a product has no secondary hash.
pub const ZERO_FIXED32: &str =
    "0x0000000000000000000000000000000000000000000000000000000000000000";

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

/// 64-char lowercase hex SHA-256 digest.
pub fn digest_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(sha256(data.as_ref()))
}

/// `0x` + [`digest_hex`], suitable for a `bytes32` contract field.
pub fn digest_fixed32(data: impl AsRef<[u8]>) -> String {
    format!("0x{}", digest_hex(data))
}

/// Re-express an already computed hex digest in the fixed-width form.
pub fn hex_to_fixed32(hex_digest: &str) -> String {
    format!("0x{}", strip_0x(hex_digest).to_ascii_lowercase())
}

/// Case-insensitive digest comparison that ignores a `0x` prefix on either side.
pub fn fixed32_eq(a: &str, b: &str) -> bool {
    strip_0x(a).eq_ignore_ascii_case(strip_0x(b))
}

/// True for a 64-char lowercase hex string (the shape of a state hash).
pub fn is_state_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}
