//! Bit-exact codecs for the records written by the platform's lock
//! settings service.
//!
//! All multi-byte integers are big-endian.

use crate::{Error, Result};

pub mod password;
pub mod spblob;
pub mod weaver;

pub use password::{PasswordData, PasswordKind};
pub use spblob::{SpBlob, SpBlobVersion};
pub use weaver::WeaverData;

/// Length of a big-endian `i32` field.
pub const INT_LEN: usize = 4;

/// Sequential reader over a record, failing with `Format` on short input.
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
    record: &'static str,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8], record: &'static str) -> Self {
        Self {
            data,
            offset: 0,
            record,
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::Format(format!(
                "{} truncated at offset {}",
                self.record, self.offset
            )));
        }
        let out = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn i32_be(&mut self) -> Result<i32> {
        let bytes = self.take(INT_LEN)?;
        let bytes: [u8; INT_LEN] = bytes
            .try_into()
            .map_err(|_| Error::Format(format!("{} bad int field", self.record)))?;
        Ok(i32::from_be_bytes(bytes))
    }

    /// Reads a non-negative `i32` length followed by that many bytes.
    pub(crate) fn length_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.i32_be()?;
        let len = usize::try_from(len)
            .map_err(|_| Error::Format(format!("{} negative length {len}", self.record)))?;
        self.take(len)
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.offset..];
        self.offset = self.data.len();
        out
    }
}
