use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

use super::SHA512_LEN;
use crate::{Error, KeyBuffer, Result};

/// Size of the zero-padded prefix block.
const PREFIX_BLOCK_LEN: usize = 128;

/// SHA-512 over `prefix` zero-padded to 128 bytes, followed by `data`.
///
/// The prefix gives domain separation: the same `data` hashed under two
/// prefixes never yields related digests.
pub fn personalized_hash(prefix: &str, data: &[u8]) -> KeyBuffer {
    let mut block = [0u8; PREFIX_BLOCK_LEN];
    let n = prefix.len().min(PREFIX_BLOCK_LEN);
    block[..n].copy_from_slice(&prefix.as_bytes()[..n]);

    let mut hasher = Sha512::new();
    hasher.update(block);
    hasher.update(data);
    let digest = hasher.finalize();

    debug_assert_eq!(digest.len(), SHA512_LEN);
    KeyBuffer::from_slice(&digest)
}

/// Single-block NIST SP800-108 counter-mode KDF over HMAC-SHA256.
///
/// Input to the PRF is
/// `be32(1) ‖ label ‖ 0x00 ‖ context ‖ be32(len(context) * 8) ‖ be32(256)`.
pub fn sp800_derive(key: &[u8], label: &[u8], context: &[u8]) -> Result<KeyBuffer> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("hmac init failed: {e}")))?;

    let context_bits = u32::try_from(context.len() * 8)
        .map_err(|_| Error::Crypto("sp800 context too long".into()))?;

    mac.update(&1u32.to_be_bytes());
    mac.update(label);
    mac.update(&[0u8]);
    mac.update(context);
    mac.update(&context_bits.to_be_bytes());
    mac.update(&256u32.to_be_bytes());

    Ok(KeyBuffer::from_slice(&mac.finalize().into_bytes()))
}
