//! Collaborators outside the key core: storage preparation and secure
//! deletion.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::Result;

/// Prepares a user's storage areas once their key is installed.
pub trait StoragePreparer {
    /// `de_area` is set when the device-encrypted area is being prepared.
    fn prepare_user_storage(&self, user_id: u32, de_area: bool) -> Result<()>;
}

/// Makes files permanently unrecoverable.
pub trait SecureDiscard {
    /// Returns `true` only if every file was discarded.
    fn secure_discard(&self, paths: &[PathBuf]) -> bool;
}

/// Overwrites each file with zeros and syncs it.
///
/// Removal is left to the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct OverwriteDiscard;

impl OverwriteDiscard {
    fn overwrite(path: &Path) -> std::io::Result<()> {
        let len = fs::metadata(path)?.len();
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::Start(0))?;

        let zeros = [0u8; 4096];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(zeros.len() as u64) as usize;
            file.write_all(&zeros[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()
    }
}

impl SecureDiscard for OverwriteDiscard {
    fn secure_discard(&self, paths: &[PathBuf]) -> bool {
        let mut success = true;
        for path in paths {
            if let Err(e) = Self::overwrite(path) {
                warn!(path = %path.display(), error = %e, "secure discard failed");
                success = false;
            }
        }
        success
    }
}

/// Storage preparer that only records the request in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyPreparer;

impl StoragePreparer for LogOnlyPreparer {
    fn prepare_user_storage(&self, user_id: u32, de_area: bool) -> Result<()> {
        tracing::info!(user_id, de_area, "user storage ready to be prepared");
        Ok(())
    }
}
