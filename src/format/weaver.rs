//! `<handle>.weaver` record: `VERSION (1) | SLOT (i32)`.

use super::Cursor;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeaverData {
    version: u8,
    slot: u32,
}

impl WeaverData {
    pub const LEN: usize = 5;

    pub fn new(version: u8, slot: u32) -> Self {
        Self { version, slot }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(data, "weaver data");
        let version = c.u8()?;
        let slot = c.i32_be()?;
        let slot =
            u32::try_from(slot).map_err(|_| Error::Format(format!("negative weaver slot {slot}")))?;
        Ok(Self::new(version, slot))
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.version;
        buf[1..].copy_from_slice(&self.slot.to_be_bytes());
        buf
    }
}
