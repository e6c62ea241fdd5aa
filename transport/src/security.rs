use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, bail};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Length of the public value each side contributes to the key exchange.
pub const PUBLIC_KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;

/// One side of the connect handshake's Diffie-Hellman exchange. The ephemeral
/// secret is consumed when the shared secret is derived, so a `KeyExchange` is
/// good for exactly one handshake.
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyExchange {
    pub fn generate() -> KeyExchange {
        let secret = EphemeralSecret::random();
        let public = PublicKey::from(&secret);
        KeyExchange { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        *self.public.as_bytes()
    }

    /// Combines the local ephemeral secret with the peer's public value.
    pub fn derive_shared_secret(
        self,
        peer_public: &[u8],
    ) -> anyhow::Result<[u8; PUBLIC_KEY_LEN]> {
        let peer_public: [u8; PUBLIC_KEY_LEN] = peer_public
            .try_into()
            .map_err(|_| anyhow!("peer public value must be {} bytes, was {}", PUBLIC_KEY_LEN, peer_public.len()))?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer_public));
        Ok(*shared.as_bytes())
    }
}

/// Derives the symmetric key from the shared secret with a one-way hash, so
/// the raw secret never doubles as key material.
pub fn derive_key(shared_secret: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// AES-256-GCM over byte spans, offered to the application layer for payloads
/// flagged as encrypted. Nonces are a random fixed part plus a counter, never
/// reused for the lifetime of the key.
pub struct PayloadCipher {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_counter: AtomicU64,
}

impl PayloadCipher {
    pub fn new(key: &[u8; 32]) -> PayloadCipher {
        PayloadCipher {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            nonce_fixed: rand::random::<u32>(),
            nonce_counter: AtomicU64::new(0),
        }
    }

    /// Produces `[12B nonce][ciphertext + tag]`.
    pub fn encrypt(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.nonce_fixed.to_be_bytes());
        nonce[4..].copy_from_slice(
            &self
                .nonce_counter
                .fetch_add(1, Ordering::AcqRel)
                .to_be_bytes(),
        );

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| anyhow!("encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            bail!("ciphertext shorter than its nonce");
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("decryption failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_the_same_key() {
        let client = KeyExchange::generate();
        let server = KeyExchange::generate();

        let client_public = client.public_bytes();
        let server_public = server.public_bytes();

        let client_secret = client.derive_shared_secret(&server_public).unwrap();
        let server_secret = server.derive_shared_secret(&client_public).unwrap();

        assert_eq!(client_secret, server_secret);
        assert_eq!(derive_key(&client_secret), derive_key(&server_secret));
    }

    #[test]
    fn test_key_is_not_the_raw_secret() {
        let a = KeyExchange::generate();
        let b = KeyExchange::generate();
        let secret = a.derive_shared_secret(&b.public_bytes()).unwrap();
        assert_ne!(derive_key(&secret), secret);
    }

    #[test]
    fn test_rejects_wrong_key_length() {
        let exchange = KeyExchange::generate();
        assert!(exchange.derive_shared_secret(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_payload_cipher_roundtrip() {
        let cipher = PayloadCipher::new(&[7u8; 32]);
        let encrypted = cipher.encrypt(b"hello world").unwrap();
        assert_ne!(&encrypted[NONCE_LEN..], b"hello world");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), b"hello world");
    }

    #[test]
    fn test_payload_cipher_rejects_tampering() {
        let cipher = PayloadCipher::new(&[7u8; 32]);
        let mut encrypted = cipher.encrypt(b"hello world").unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;
        assert!(cipher.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_nonces_are_unique() {
        let cipher = PayloadCipher::new(&[7u8; 32]);
        let a = cipher.encrypt(b"x").unwrap();
        let b = cipher.encrypt(b"x").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }
}
