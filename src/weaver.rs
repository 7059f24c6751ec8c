//! Secondary-factor verification against hardware slots.

use std::cell::OnceCell;

use tracing::{debug, error, warn};

use crate::hardware::{WeaverConfig, WeaverDevice, WeaverStatus};
use crate::{Error, KeyBuffer, Result};

/// Verifier over a [`WeaverDevice`] with its configuration fetched once.
pub struct Weaver<D> {
    device: D,
    config: OnceCell<WeaverConfig>,
}

impl<D: WeaverDevice> Weaver<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            config: OnceCell::new(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn config(&self) -> Result<WeaverConfig> {
        if let Some(config) = self.config.get() {
            return Ok(*config);
        }
        let config = self.device.config()?;
        debug!(
            slots = config.slots,
            key_size = config.key_size,
            value_size = config.value_size,
            "weaver config"
        );
        Ok(*self.config.get_or_init(|| config))
    }

    /// Presents `key` to `slot` and returns the stored payload.
    ///
    /// The key is truncated or zero-extended to the device key size.
    pub fn verify(&self, slot: u32, key: &[u8]) -> Result<KeyBuffer> {
        let config = self.config()?;
        if slot >= config.slots {
            error!(slot, slots = config.slots, "weaver slot out of range");
            return Err(Error::Format(format!(
                "weaver slot {slot} out of range ({} slots)",
                config.slots
            )));
        }

        let mut sized = KeyBuffer::from_slice(key);
        sized.resize(config.key_size as usize);

        let response = self.device.read(slot, &sized)?;
        if response.timeout_secs > 0 {
            warn!(slot, seconds = response.timeout_secs, "weaver throttled");
            return Err(Error::Throttled {
                slot,
                seconds: response.timeout_secs,
            });
        }
        if response.status != WeaverStatus::Ok {
            error!(slot, status = ?response.status, "weaver read failed");
            return Err(Error::Hardware(format!(
                "weaver read of slot {slot} failed: {:?}",
                response.status
            )));
        }
        Ok(response.payload)
    }
}
