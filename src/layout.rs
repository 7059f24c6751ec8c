//! Where things live under the data partition root.

use std::path::{Path, PathBuf};

/// Name the chosen CE key directory is renamed to.
pub const CURRENT_CE_KEY: &str = "current";

const GATEKEEPER_PASSWORD_KEY: &str = "gatekeeper.password.key";
const GATEKEEPER_PATTERN_KEY: &str = "gatekeeper.pattern.key";

/// Path layout of a data partition mounted at `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn user_keys(&self) -> PathBuf {
        self.root.join("misc/vold/user_keys")
    }

    pub fn de_keys(&self) -> PathBuf {
        self.user_keys().join("de")
    }

    pub fn ce_keys(&self) -> PathBuf {
        self.user_keys().join("ce")
    }

    pub fn de_key(&self, user_id: u32) -> PathBuf {
        self.de_keys().join(user_id.to_string())
    }

    /// Directory holding the CE key candidates of one user.
    pub fn ce_key_dir(&self, user_id: u32) -> PathBuf {
        self.ce_keys().join(user_id.to_string())
    }

    pub fn current_ce_key(&self, user_id: u32) -> PathBuf {
        self.ce_key_dir(user_id).join(CURRENT_CE_KEY)
    }

    pub fn unencrypted(&self) -> PathBuf {
        self.root.join("unencrypted")
    }

    pub fn device_key(&self) -> PathBuf {
        self.unencrypted().join("key")
    }

    pub fn device_key_temp(&self) -> PathBuf {
        self.unencrypted().join("temp")
    }

    pub fn device_key_mode(&self) -> PathBuf {
        self.unencrypted().join("mode")
    }

    pub fn device_key_ref(&self) -> PathBuf {
        self.unencrypted().join("ref")
    }

    pub fn spblob_dir(&self, user_id: u32) -> PathBuf {
        self.root
            .join("system_de")
            .join(user_id.to_string())
            .join("spblob")
    }

    fn system_user_dir(&self, user_id: u32) -> PathBuf {
        let system = self.root.join("system");
        if user_id == 0 {
            system
        } else {
            system.join("users").join(user_id.to_string())
        }
    }

    /// Legacy password handle file.
    pub fn gatekeeper_password_key(&self, user_id: u32) -> PathBuf {
        self.system_user_dir(user_id).join(GATEKEEPER_PASSWORD_KEY)
    }

    /// Legacy pattern handle file.
    pub fn gatekeeper_pattern_key(&self, user_id: u32) -> PathBuf {
        self.system_user_dir(user_id).join(GATEKEEPER_PATTERN_KEY)
    }

    pub fn keystore_user_dir(&self, user_id: u32) -> PathBuf {
        self.root
            .join("misc/keystore")
            .join(format!("user_{user_id}"))
    }
}

impl Default for DataLayout {
    fn default() -> Self {
        Self::new("/data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_key_paths() {
        let layout = DataLayout::new("/mnt/data");
        assert_eq!(
            layout.de_key(10),
            PathBuf::from("/mnt/data/misc/vold/user_keys/de/10")
        );
        assert_eq!(
            layout.current_ce_key(0),
            PathBuf::from("/mnt/data/misc/vold/user_keys/ce/0/current")
        );
        assert_eq!(
            layout.device_key_temp(),
            PathBuf::from("/mnt/data/unencrypted/temp")
        );
    }

    #[test]
    fn gatekeeper_files_move_for_secondary_users() {
        let layout = DataLayout::default();
        assert_eq!(
            layout.gatekeeper_password_key(0),
            PathBuf::from("/data/system/gatekeeper.password.key")
        );
        assert_eq!(
            layout.gatekeeper_pattern_key(11),
            PathBuf::from("/data/system/users/11/gatekeeper.pattern.key")
        );
    }

    #[test]
    fn synthetic_password_paths() {
        let layout = DataLayout::default();
        assert_eq!(
            layout.spblob_dir(0),
            PathBuf::from("/data/system_de/0/spblob")
        );
        assert_eq!(
            layout.keystore_user_dir(10),
            PathBuf::from("/data/misc/keystore/user_10")
        );
    }
}
