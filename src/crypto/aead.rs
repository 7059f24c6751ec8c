use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use getrandom::fill;

use super::{AES_KEY_LEN, GCM_MAC_LEN, GCM_NONCE_LEN};
use crate::{Error, KeyBuffer, Result};

/// Fill buffer with cryptographically secure random bytes
pub fn secure_random(buf: &mut [u8]) -> Result<()> {
    fill(buf).map_err(|_| Error::Crypto("OS random generator unavailable".into()))
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm> {
    if key.len() < AES_KEY_LEN {
        return Err(Error::Crypto(format!(
            "AES-256 key needs {AES_KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(&key[..AES_KEY_LEN])
        .map_err(|_| Error::Crypto("cipher init failed".into()))
}

/// Encrypt plaintext, returning `nonce ‖ ciphertext ‖ tag`.
///
/// Only the first 32 bytes of `key` are used.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;

    let mut nonce = [0u8; GCM_NONCE_LEN];
    secure_random(&mut nonce)?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Crypto("encryption failed".into()))?;

    let mut out = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `nonce ‖ ciphertext ‖ tag`.
///
/// The tag is verified before any plaintext is released.
pub fn decrypt(key: &[u8], data: &[u8]) -> Result<KeyBuffer> {
    if data.len() < GCM_NONCE_LEN + GCM_MAC_LEN {
        return Err(Error::Crypto(format!(
            "ciphertext too short: {} bytes",
            data.len()
        )));
    }
    let (nonce, body) = data.split_at(GCM_NONCE_LEN);
    decrypt_parts(key, nonce, body)
}

/// Decrypt `ciphertext ‖ tag` with an explicit nonce.
pub fn decrypt_parts(key: &[u8], nonce: &[u8], body: &[u8]) -> Result<KeyBuffer> {
    if nonce.len() != GCM_NONCE_LEN {
        return Err(Error::Crypto(format!("bad nonce length {}", nonce.len())));
    }
    if body.len() < GCM_MAC_LEN {
        return Err(Error::Crypto("ciphertext shorter than tag".into()));
    }

    let plaintext = cipher(key)?
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| Error::Crypto("authentication failed".into()))?;
    Ok(KeyBuffer::new(plaintext))
}
