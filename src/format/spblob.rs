//! `<handle>.spblob` record.
//!
//! ```text
//! VERSION (1) | TYPE (1) | NONCE (12) | CIPHERTEXT ‖ TAG (16)
//! ```

use crate::crypto::{GCM_MAC_LEN, GCM_NONCE_LEN};
use crate::{Error, Result};

/// Blob type for a synthetic password protected by a user credential.
pub const PASSWORD_BASED: u8 = 0;

const HEADER_LEN: usize = 2;

/// Layering of the two AES-GCM passes, and the final secret derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpBlobVersion {
    /// Software layer outside, hardware layer inside; hashed secret.
    V1,
    /// Hardware layer outside, software layer inside; hashed secret.
    V2,
    /// As V2, with an SP800-108 derived secret.
    V3,
}

impl SpBlobVersion {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(SpBlobVersion::V1),
            2 => Ok(SpBlobVersion::V2),
            3 => Ok(SpBlobVersion::V3),
            other => Err(Error::VersionMismatch {
                expected: "1, 2 or 3".into(),
                found: other.to_string(),
            }),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            SpBlobVersion::V1 => 1,
            SpBlobVersion::V2 => 2,
            SpBlobVersion::V3 => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpBlob {
    version: SpBlobVersion,
    nonce: [u8; GCM_NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl SpBlob {
    pub fn new(version: SpBlobVersion, nonce: [u8; GCM_NONCE_LEN], ciphertext: Vec<u8>) -> Self {
        Self {
            version,
            nonce,
            ciphertext,
        }
    }

    pub fn version(&self) -> SpBlobVersion {
        self.version
    }

    pub fn nonce(&self) -> &[u8; GCM_NONCE_LEN] {
        &self.nonce
    }

    /// Ciphertext with the trailing tag.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + GCM_NONCE_LEN + GCM_MAC_LEN {
            return Err(Error::Format(format!(
                "spblob too short: {} bytes",
                data.len()
            )));
        }

        let version = SpBlobVersion::from_byte(data[0])?;
        if data[1] != PASSWORD_BASED {
            return Err(Error::Format(format!(
                "spblob type {} is not password based",
                data[1]
            )));
        }

        let nonce: [u8; GCM_NONCE_LEN] = data[HEADER_LEN..HEADER_LEN + GCM_NONCE_LEN]
            .try_into()
            .map_err(|_| Error::Format("spblob nonce".into()))?;
        let ciphertext = data[HEADER_LEN + GCM_NONCE_LEN..].to_vec();

        Ok(Self::new(version, nonce, ciphertext))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + GCM_NONCE_LEN + self.ciphertext.len());
        buf.push(self.version.as_byte());
        buf.push(PASSWORD_BASED);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.ciphertext);
        buf
    }
}
