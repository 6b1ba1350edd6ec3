use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use anyhow::Result;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

/// Generate a random 256-bit key for AES-256-GCM.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Decode a base64 key.
pub fn key_from_base64(encoded: &str) -> Result<[u8; 32]> {
    let bytes = BASE64.decode(encoded.trim())?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("Invalid key length, expected 32 bytes"))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_key_roundtrip() {
        let key = generate_key();
        assert_eq!(key_from_base64(&BASE64.encode(key)).unwrap(), key);
    }

    #[test]
    fn short_key_is_rejected() {
        let encoded = BASE64.encode([7u8; 16]);
        assert!(key_from_base64(&encoded).is_err());
    }
}
