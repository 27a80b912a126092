pub mod aes {
    use aes_gcm::{
        Aes256Gcm, Nonce,
        aead::{Aead, KeyInit},
    };
    use hkdf::Hkdf;
    use sha2::Sha256;

    /// AES-GCM uses a 12-byte nonce
    pub const NONCE_LEN: usize = 12;

    /// Derives a 256-bit key from a secret. Different `info` labels yield
    /// independent keys from the same secret.
    pub fn derive_key(secret: &[u8], info: &str) -> Result<[u8; 32], String> {
        let mut key = [0u8; 32];
        Hkdf::<Sha256>::new(None, secret)
            .expand(info.as_bytes(), &mut key)
            .map_err(|e| format!("Key derivation failed: {}", e))?;
        Ok(key)
    }

    /// Encrypt with AES-256-GCM. The output is `nonce || ciphertext`, the
    /// ciphertext including the authentication tag.
    pub fn encrypt(key: &[u8; 32], nonce: [u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, String> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| format!("Key error: {}", e))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| format!("Encryption failed: {}", e))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt data produced by [`encrypt`].
    pub fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, String> {
        if data.len() < NONCE_LEN {
            return Err("Data too short to contain nonce".to_string());
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| format!("Key error: {}", e))?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| format!("Decryption failed (likely wrong key or tampered data): {}", e))
    }
}

#[cfg(test)]
mod test {
    use super::aes;

    #[test]
    fn encrypt_then_decrypt() {
        let key = aes::derive_key(b"test secret", "enc").unwrap();
        let encrypted = aes::encrypt(&key, [7u8; 12], b"Hello, World!").unwrap();
        let decrypted = aes::decrypt(&key, &encrypted).unwrap();
        assert_eq!(decrypted, b"Hello, World!");
    }

    #[test]
    fn labels_give_independent_keys() {
        let a = aes::derive_key(b"secret", "encryption").unwrap();
        let b = aes::derive_key(b"secret", "signing").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = aes::derive_key(b"secret", "enc").unwrap();
        let mut encrypted = aes::encrypt(&key, [1u8; 12], b"payload").unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;
        assert!(aes::decrypt(&key, &encrypted).is_err());
    }
}
