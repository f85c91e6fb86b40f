//! Symmetric byte-blob cipher used to persist credentials.
//!
//! The control plane treats the cipher as an opaque encrypt/decrypt
//! contract; [`XorCipher`] is the repeating-key implementation shipped with
//! the appliance.

/// Symmetric encrypt/decrypt contract over byte blobs.
pub trait Cipher: Send + Sync {
    /// Encrypt `data` under `key`.
    fn encrypt(&self, data: &[u8], key: &[u8]) -> Vec<u8>;

    /// Decrypt `data` under `key`.
    fn decrypt(&self, data: &[u8], key: &[u8]) -> Vec<u8>;
}

/// Repeating-key XOR. Obfuscation only, not confidentiality.
#[derive(Debug, Clone, Copy, Default)]
pub struct XorCipher;

impl XorCipher {
    fn apply(data: &[u8], key: &[u8]) -> Vec<u8> {
        if key.is_empty() {
            return data.to_vec();
        }
        data.iter()
            .zip(key.iter().cycle())
            .map(|(byte, k)| byte ^ k)
            .collect()
    }
}

impl Cipher for XorCipher {
    fn encrypt(&self, data: &[u8], key: &[u8]) -> Vec<u8> {
        Self::apply(data, key)
    }

    fn decrypt(&self, data: &[u8], key: &[u8]) -> Vec<u8> {
        Self::apply(data, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_is_symmetric() {
        let cipher = XorCipher;
        let key = b"0123456789abcdef";
        let plain = br#"{"wifi_credentials":{"SSID":"home","PASSWORD":"secret"}}"#;

        let encrypted = cipher.encrypt(plain, key);
        assert_ne!(encrypted.as_slice(), plain.as_slice());
        assert_eq!(cipher.decrypt(&encrypted, key), plain.to_vec());
    }

    #[test]
    fn test_empty_key_passes_through() {
        assert_eq!(XorCipher.encrypt(b"abc", b""), b"abc".to_vec());
    }
}
