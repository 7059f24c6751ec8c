//! Owned buffer for key material that is wiped when released.

use std::fmt;
use std::ops::Deref;
use zeroize::{Zeroize, Zeroizing};

/// Unwrapped key bytes.
///
/// The contents are overwritten with zeros on drop, on every exit path.
/// `KeyBuffer` is deliberately not `Clone`: key material moves between
/// owners instead of being copied.
#[derive(Default, PartialEq, Eq)]
pub struct KeyBuffer(Zeroizing<Vec<u8>>);

impl KeyBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }

    /// Allocates a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    /// Fills a new buffer of `len` bytes from the OS random source.
    pub fn random(len: usize) -> crate::Result<Self> {
        let mut buf = Self::zeroed(len);
        getrandom::fill(buf.as_mut_slice())
            .map_err(|e| crate::Error::Crypto(format!("random source failed: {e}")))?;
        Ok(buf)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Makes room for `additional` more bytes.
    ///
    /// `Vec` would free the old allocation without wiping it, so the
    /// contents move into a fresh allocation and the old one is zeroized
    /// on drop.
    fn grow(&mut self, additional: usize) {
        let needed = self.0.len() + additional;
        if needed <= self.0.capacity() {
            return;
        }
        let mut grown = Vec::with_capacity(needed.max(self.0.capacity() * 2));
        grown.extend_from_slice(&self.0);
        self.0 = Zeroizing::new(grown);
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.grow(bytes.len());
        self.0.extend_from_slice(bytes);
    }

    /// Shrinks or zero-extends the buffer to exactly `len` bytes.
    pub fn resize(&mut self, len: usize) {
        if len < self.0.len() {
            self.0[len..].zeroize();
        } else {
            self.grow(len - self.0.len());
        }
        self.0.resize(len, 0);
    }

    /// Concatenates two byte strings into a fresh buffer.
    pub fn concat(a: &[u8], b: &[u8]) -> Self {
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        Self::new(out)
    }
}

impl Deref for KeyBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for KeyBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for KeyBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Debug for KeyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyBuffer([REDACTED; {}])", self.0.len())
    }
}
