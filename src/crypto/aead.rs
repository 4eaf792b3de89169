//! ChaCha20-Poly1305 with a random nonce carried in front of the ciphertext.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;

use crate::error::{Error, Result};

pub const NONCE_LEN: usize = 12;

/// Encrypt `plaintext` bound to `aad`, returning `nonce || ciphertext`.
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Internal("Encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Reverse [`seal`]. Any tampering, wrong key or wrong `aad` is an authentication failure.
pub fn open(key: &[u8; 32], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(Error::authentication("Ciphertext too short"));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::authentication("Ciphertext failed integrity check"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7; 32];

    #[test]
    fn nonces_are_fresh() {
        let a = seal(&KEY, b"same", b"ctx").unwrap();
        let b = seal(&KEY, b"same", b"ctx").unwrap();
        assert_ne!(a, b);
        assert_eq!(open(&KEY, &a, b"ctx").unwrap(), b"same");
        assert_eq!(open(&KEY, &b, b"ctx").unwrap(), b"same");
    }

    #[test]
    fn tampering_is_detected() {
        let mut sealed = seal(&KEY, b"secret", b"ctx").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(matches!(open(&KEY, &sealed, b"ctx"), Err(Error::Authentication(_))));
        assert!(matches!(open(&KEY, &[0; 4], b"ctx"), Err(Error::Authentication(_))));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let sealed = seal(&KEY, b"secret", b"ctx").unwrap();
        assert!(matches!(open(&[8; 32], &sealed, b"ctx"), Err(Error::Authentication(_))));
    }
}
