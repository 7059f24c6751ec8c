//! Device, DE and CE key installation.
//!
//! [`KeyManager`] owns the key reference registry. Installing a key means
//! recovering it from its envelope, handing it to the kernel keyring and
//! recording its raw reference; only the last step marks it unlocked.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::config::Capabilities;
use crate::hardware::{AuthorizationSet, KeyBackend, KeyParam};
use crate::key_storage::{self, KeyAuthentication};
use crate::keyring::{self, AES_256_XTS_KEY_LEN, KernelKeyring, RawKeyRef};
use crate::layout::DataLayout;
use crate::platform::SecureDiscard;
use crate::registry::{KeyKind, KeyRefRegistry};
use crate::storage;
use crate::{Error, KeyBuffer, Result};

pub struct KeyManager {
    layout: DataLayout,
    caps: Capabilities,
    backend: Box<dyn KeyBackend>,
    keyring: Box<dyn KernelKeyring>,
    discard: Box<dyn SecureDiscard>,
    registry: KeyRefRegistry,
}

impl KeyManager {
    pub fn new(
        layout: DataLayout,
        caps: Capabilities,
        backend: Box<dyn KeyBackend>,
        keyring: Box<dyn KernelKeyring>,
        discard: Box<dyn SecureDiscard>,
    ) -> Self {
        Self {
            layout,
            caps,
            backend,
            keyring,
            discard,
            registry: KeyRefRegistry::new(),
        }
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn backend(&self) -> &dyn KeyBackend {
        self.backend.as_ref()
    }

    pub fn registry(&self) -> &KeyRefRegistry {
        &self.registry
    }

    pub fn is_unlocked(&self, user_id: u32) -> bool {
        self.registry.contains(KeyKind::Ce, user_id)
    }

    /// Installs the device-wide key, creating it on first use.
    ///
    /// Idempotent within one process.
    pub fn initialize_global_de(&mut self) -> Result<RawKeyRef> {
        if let Some(raw_ref) = self.registry.device() {
            info!("device key already initialized");
            return Ok(raw_ref);
        }

        let unencrypted = self.layout.unencrypted();
        storage::create_dir_all(&unencrypted)?;

        let mode = format!("{}:{}", self.caps.contents_mode, self.caps.filenames_mode);
        write_if_changed(&self.layout.device_key_mode(), mode.as_bytes())?;

        let raw_ref = self.retrieve_and_install_key(
            true,
            &KeyAuthentication::empty(),
            &self.layout.device_key(),
            &self.layout.device_key_temp(),
            KeyKind::De,
        )?;
        write_if_changed(&self.layout.device_key_ref(), raw_ref.as_bytes())?;

        self.registry.set_device(raw_ref);
        info!(raw_ref = %raw_ref, "device key installed");
        Ok(raw_ref)
    }

    /// Recovers the key at `key_path` and installs it in the kernel.
    ///
    /// A missing key is created when `create_if_absent` is set, otherwise
    /// it is [`Error::NotFound`]. Nothing is recorded in the registry.
    pub fn retrieve_and_install_key(
        &self,
        create_if_absent: bool,
        auth: &KeyAuthentication,
        key_path: &Path,
        tmp_path: &Path,
        kind: KeyKind,
    ) -> Result<RawKeyRef> {
        let key = if key_storage::path_exists(key_path) {
            debug!(path = %key_path.display(), "key exists, retrieving");
            key_storage::retrieve_key(key_path, auth, self.backend())?
        } else {
            if !create_if_absent {
                error!(path = %key_path.display(), "no key found");
                return Err(Error::NotFound(format!("no key at {}", key_path.display())));
            }
            info!(path = %key_path.display(), "creating new key");
            let key = self.generate_storage_key(kind)?;
            key_storage::store_key_atomically(
                key_path,
                tmp_path,
                auth,
                &key,
                self.backend(),
                self.discard.as_ref(),
                &self.caps,
            )?;
            key
        };
        self.install(&key)
    }

    fn generate_storage_key(&self, kind: KeyKind) -> Result<KeyBuffer> {
        if !self.caps.wrapped_key_supported {
            return KeyBuffer::random(AES_256_XTS_KEY_LEN);
        }
        let key_type = match kind {
            KeyKind::De => 0,
            KeyKind::Ce => 1,
        };
        let params = AuthorizationSet::aes_encryption_key(256)
            .gcm_mode_min_mac(128)
            .with(KeyParam::UserId(u32::MAX))
            .with(KeyParam::FbeIce)
            .with(KeyParam::FbeKeyType(key_type));
        self.backend.generate_wrapped_key(&params)
    }

    fn install(&self, key: &KeyBuffer) -> Result<RawKeyRef> {
        if self.caps.wrapped_key_supported {
            let ephemeral = self.backend.export_ephemeral_key(key)?;
            keyring::install_key(self.keyring.as_ref(), &ephemeral, &self.caps)
        } else {
            keyring::install_key(self.keyring.as_ref(), key, &self.caps)
        }
    }

    /// Installs the DE key of one user with the device-bound authentication.
    pub fn install_de_key(&mut self, user_id: u32) -> Result<RawKeyRef> {
        if let Ok(raw_ref) = self.registry.lookup(KeyKind::De, user_id) {
            return Ok(raw_ref);
        }
        let key_path = self.layout.de_key(user_id);
        let key = key_storage::retrieve_key(&key_path, &KeyAuthentication::empty(), self.backend())?;
        let raw_ref = self.install(&key)?;
        self.registry.insert(KeyKind::De, user_id, raw_ref);
        debug!(user_id, "installed de key");
        Ok(raw_ref)
    }

    /// Installs every DE key found under the user key directory.
    pub fn load_all_de_keys(&mut self) -> Result<()> {
        let de_dir = self.layout.de_keys();
        let entries = fs::read_dir(&de_dir).map_err(|e| Error::io(&de_dir, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&de_dir, e))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let name = entry.file_name();
            let user_id = match name.to_str().and_then(parse_user_id) {
                Some(id) if is_dir => id,
                _ => {
                    debug!(name = ?name, "skipping non-de-key");
                    continue;
                }
            };
            if self.registry.contains(KeyKind::De, user_id) {
                continue;
            }
            self.install_de_key(user_id)?;
        }
        Ok(())
    }

    /// Installs the DE keys once the primary user's key is known to exist.
    pub fn init_user0(&mut self) -> Result<()> {
        let de0 = self.layout.de_key(0);
        if !key_storage::path_exists(&de0) {
            error!(path = %de0.display(), "de key path not found");
            return Err(Error::NotFound(format!(
                "user 0 de key missing at {}",
                de0.display()
            )));
        }
        self.load_all_de_keys()
    }

    /// Unlocks the CE key of a user; a no-op if already unlocked.
    pub fn install_ce_key(&mut self, user_id: u32, auth: &KeyAuthentication) -> Result<RawKeyRef> {
        if let Ok(raw_ref) = self.registry.lookup(KeyKind::Ce, user_id) {
            return Ok(raw_ref);
        }
        let key = self.read_and_fixate_ce_key(user_id, auth)?;
        let raw_ref = self.install(&key)?;
        self.registry.insert(KeyKind::Ce, user_id, raw_ref);
        debug!(user_id, "installed ce key");
        Ok(raw_ref)
    }

    fn read_and_fixate_ce_key(&self, user_id: u32, auth: &KeyAuthentication) -> Result<KeyBuffer> {
        let dir = self.layout.ce_key_dir(user_id);
        let paths = ce_key_paths(&dir)?;

        let mut last_err = None;
        for path in &paths {
            debug!(path = %path.display(), "trying user ce key");
            match key_storage::retrieve_key(path, auth, self.backend()) {
                Ok(key) => {
                    debug!("successfully retrieved key");
                    self.fixate_ce_key(&dir, path, &paths);
                    return Ok(key);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "ce key candidate rejected");
                    last_err = Some(e);
                }
            }
        }

        error!(user_id, "failed to find working ce key");
        Err(last_err
            .unwrap_or_else(|| Error::NotFound(format!("no ce key for user {user_id}"))))
    }

    /// Discards every candidate but `winner` and renames it to `current`.
    /// Failures here are only logged.
    fn fixate_ce_key(&self, dir: &Path, winner: &Path, paths: &[PathBuf]) {
        for other in paths.iter().filter(|p| p.as_path() != winner) {
            if !key_storage::destroy_key(other, self.backend(), self.discard.as_ref()) {
                warn!(path = %other.display(), "failed to destroy stale ce key");
            }
        }
        let current = dir.join(crate::layout::CURRENT_CE_KEY);
        if winner != current {
            debug!(from = %winner.display(), to = %current.display(), "renaming ce key");
            if let Err(e) = storage::rename_dir(winner, &current) {
                warn!(error = %e, "unable to rename ce key");
            }
        }
    }

    /// Unlocks a user's CE key with a token and secret.
    pub fn unlock_user_key(&mut self, user_id: u32, token: &[u8], secret: &[u8]) -> Result<()> {
        if self.is_unlocked(user_id) {
            warn!(user_id, "tried to unlock already-unlocked key");
            return Ok(());
        }
        let auth = KeyAuthentication::new(token, secret);
        self.install_ce_key(user_id, &auth).map_err(|e| {
            error!(user_id, error = %e, "couldn't read ce key");
            e
        })?;
        Ok(())
    }

    /// Removes one installed key from the kernel and forgets it.
    ///
    /// `true` if nothing was installed or every alias was unlinked.
    pub fn evict_key(&mut self, kind: KeyKind, user_id: u32) -> bool {
        let Some(raw_ref) = self.registry.remove(kind, user_id) else {
            return true;
        };
        let evicted = keyring::evict_key(self.keyring.as_ref(), &raw_ref, &self.caps.keyring_name);
        if !evicted {
            warn!(user_id, kind = %kind, "failed to evict key");
        }
        evicted
    }

    /// Removes a user's CE and DE keys from the kernel and forgets them.
    ///
    /// Best-effort; `true` only if every eviction succeeded.
    pub fn evict_user_keys(&mut self, user_id: u32) -> bool {
        let ce = self.evict_key(KeyKind::Ce, user_id);
        let de = self.evict_key(KeyKind::De, user_id);
        ce && de
    }
}

fn parse_user_id(name: &str) -> Option<u32> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// CE key candidate directories, newest first.
fn ce_key_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let starts_with_c = entry.file_name().to_str().is_some_and(|n| n.starts_with('c'));
        if !is_dir || !starts_with_c {
            debug!(name = ?entry.file_name(), "skipping non-key");
            continue;
        }
        paths.push(entry.path());
    }
    paths.sort();
    paths.reverse();
    Ok(paths)
}

fn write_if_changed(path: &Path, data: &[u8]) -> Result<()> {
    if path.exists() && fs::read(path).map_err(|e| Error::io(path, e))? == data {
        return Ok(());
    }
    storage::write_file(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::crypto::ScryptParams;
    use crate::key_storage::tests::NoBackend;
    use crate::keyring::tests::MemoryKeyring;
    use crate::platform::OverwriteDiscard;
    use tempfile::tempdir;

    fn manager(root: &Path) -> KeyManager {
        let caps = Capabilities {
            scrypt_params: ScryptParams::new(4, 0, 0),
            ..Capabilities::default()
        };
        KeyManager::new(
            DataLayout::new(root),
            caps,
            Box::new(NoBackend),
            Box::new(MemoryKeyring::default()),
            Box::new(OverwriteDiscard),
        )
    }

    // Secret without token stays on the software path.
    fn software_auth(secret: &[u8]) -> KeyAuthentication {
        KeyAuthentication::new(b"", secret)
    }

    fn store_candidate(km: &KeyManager, user_id: u32, name: &str, secret: &[u8]) -> KeyBuffer {
        let dir = km.layout().ce_key_dir(user_id);
        storage::create_dir_all(&dir).unwrap();
        let key = KeyBuffer::random(64).unwrap();
        key_storage::store_key(
            &dir.join(name),
            &software_auth(secret),
            &key,
            km.backend(),
            km.capabilities(),
        )
        .unwrap();
        key
    }

    #[test]
    fn user_ids_must_be_numeric() {
        assert_eq!(parse_user_id("10"), Some(10));
        assert_eq!(parse_user_id(""), None);
        assert_eq!(parse_user_id("+1"), None);
        assert_eq!(parse_user_id("x0"), None);
    }

    #[test]
    fn candidates_are_newest_first_and_skip_non_keys() {
        let dir = tempdir().unwrap();
        for name in ["cx0000000001", "cx0000000002", "current", "other"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("cfile"), b"").unwrap();

        let names: Vec<_> = ce_key_paths(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, ["cx0000000002", "cx0000000001", "current"]);
    }

    #[test]
    fn working_ce_candidate_is_fixated() {
        let root = tempdir().unwrap();
        let mut km = manager(root.path());
        store_candidate(&km, 10, "cx0000000002", b"old");
        let key = store_candidate(&km, 10, "cx0000000001", b"right");

        let raw_ref = km.install_ce_key(10, &software_auth(b"right")).unwrap();
        assert_eq!(raw_ref, keyring::raw_key_ref(&key, false));
        assert_eq!(km.registry().lookup(KeyKind::Ce, 10).unwrap(), raw_ref);

        let ce_dir = km.layout().ce_key_dir(10);
        assert!(ce_dir.join("current").exists());
        assert!(!ce_dir.join("cx0000000001").exists());
        assert!(!ce_dir.join("cx0000000002").exists());
    }

    #[test]
    fn wrong_secret_installs_nothing() {
        let root = tempdir().unwrap();
        let mut km = manager(root.path());
        store_candidate(&km, 0, "current", b"right");

        let err = km.install_ce_key(0, &software_auth(b"wrong")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
        assert!(!km.is_unlocked(0));
        assert!(km.layout().current_ce_key(0).exists());
    }

    #[test]
    fn unlock_is_idempotent() {
        let root = tempdir().unwrap();
        let mut km = manager(root.path());
        store_candidate(&km, 0, "current", b"pw");

        km.unlock_user_key(0, b"", b"pw").unwrap();
        let first = km.registry().lookup(KeyKind::Ce, 0).unwrap();
        // second call does not touch the envelope
        km.unlock_user_key(0, b"", b"wrong").unwrap();
        assert_eq!(km.registry().lookup(KeyKind::Ce, 0).unwrap(), first);
    }

    #[test]
    fn missing_key_without_create_is_not_found() {
        let root = tempdir().unwrap();
        let km = manager(root.path());
        let err = km
            .retrieve_and_install_key(
                false,
                &KeyAuthentication::empty(),
                &root.path().join("key"),
                &root.path().join("tmp"),
                KeyKind::De,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn software_key_is_created_on_demand() {
        let root = tempdir().unwrap();
        let km = manager(root.path());
        let key_path = root.path().join("key");
        let auth = software_auth(b"pw");

        let created = km
            .retrieve_and_install_key(true, &auth, &key_path, &root.path().join("tmp"), KeyKind::Ce)
            .unwrap();
        let again = km
            .retrieve_and_install_key(false, &auth, &key_path, &root.path().join("tmp"), KeyKind::Ce)
            .unwrap();
        assert_eq!(created, again);
    }

    #[test]
    fn init_user0_requires_primary_de_key() {
        let root = tempdir().unwrap();
        let mut km = manager(root.path());
        storage::create_dir_all(&km.layout().de_keys()).unwrap();
        assert_eq!(km.init_user0().unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn evict_forgets_installed_keys() {
        let root = tempdir().unwrap();
        let mut km = manager(root.path());
        store_candidate(&km, 0, "current", b"pw");
        km.unlock_user_key(0, b"", b"pw").unwrap();

        assert!(km.evict_user_keys(0));
        assert!(!km.is_unlocked(0));
    }

    #[test]
    fn evicting_ce_leaves_de_installed() {
        let root = tempdir().unwrap();
        let mut km = manager(root.path());
        store_candidate(&km, 0, "current", b"pw");
        km.unlock_user_key(0, b"", b"pw").unwrap();
        km.registry.insert(KeyKind::De, 0, RawKeyRef::new([9; 8]));

        assert!(km.evict_key(KeyKind::Ce, 0));
        assert!(!km.is_unlocked(0));
        assert!(km.registry().contains(KeyKind::De, 0));
        // nothing left to evict
        assert!(km.evict_key(KeyKind::Ce, 0));
    }
}
