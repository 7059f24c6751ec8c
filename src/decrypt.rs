//! Unlocking a user from a presented credential.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::crypto::{self, prefix};
use crate::format::PasswordKind;
use crate::fscrypt::KeyManager;
use crate::hardware::{Gatekeeper, WeaverDevice};
use crate::layout::DataLayout;
use crate::platform::StoragePreparer;
use crate::registry::KeyKind;
use crate::synthetic::{self, SpHandle};
use crate::weaver::Weaver;
use crate::{Error, Result};

/// Largest user id accepted.
pub const MAX_USER_ID: u32 = 9999;

/// Credential meaning "no credential set".
pub const DEFAULT_CREDENTIAL: &[u8] = b"!";

/// Kind of credential a user has enrolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordType {
    Unknown,
    PinOrPassword,
    Pattern,
}

impl fmt::Display for PasswordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PasswordType::Unknown => "unknown",
            PasswordType::PinOrPassword => "password",
            PasswordType::Pattern => "pattern",
        })
    }
}

/// Step of an unlock attempt, reported on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptStep {
    ValidateUser,
    DeviceKey,
    UserDeKeys,
    LocateCredential,
    VerifyCredential,
    DerivePasswordToken,
    VerifyWeaver,
    UnwrapSyntheticPassword,
    UnlockKey,
    PrepareStorage,
}

impl fmt::Display for DecryptStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecryptStep::ValidateUser => "validate user",
            DecryptStep::DeviceKey => "install device key",
            DecryptStep::UserDeKeys => "install user DE keys",
            DecryptStep::LocateCredential => "locate credential data",
            DecryptStep::VerifyCredential => "verify credential",
            DecryptStep::DerivePasswordToken => "derive password token",
            DecryptStep::VerifyWeaver => "weaver verify",
            DecryptStep::UnwrapSyntheticPassword => "unwrap synthetic password",
            DecryptStep::UnlockKey => "unlock user key",
            DecryptStep::PrepareStorage => "prepare user storage",
        })
    }
}

/// A failed unlock attempt and the step it failed at.
#[derive(Debug, thiserror::Error)]
#[error("{step} failed: {source}")]
pub struct DecryptError {
    pub step: DecryptStep,
    #[source]
    pub source: Error,
}

impl DecryptError {
    pub fn kind(&self) -> crate::ErrorKind {
        self.source.kind()
    }
}

trait StepExt<T> {
    fn step(self, step: DecryptStep) -> std::result::Result<T, DecryptError>;
}

impl<T> StepExt<T> for Result<T> {
    fn step(self, step: DecryptStep) -> std::result::Result<T, DecryptError> {
        self.map_err(|source| {
            error!(%step, error = %source, "decrypt step failed");
            DecryptError { step, source }
        })
    }
}

/// Drives an unlock attempt from credential to installed key.
pub struct Decryptor {
    keys: KeyManager,
    weaver: Weaver<Box<dyn WeaverDevice>>,
    gatekeeper: Box<dyn Gatekeeper>,
    preparer: Box<dyn StoragePreparer>,
}

impl Decryptor {
    pub fn new(
        keys: KeyManager,
        weaver: Box<dyn WeaverDevice>,
        gatekeeper: Box<dyn Gatekeeper>,
        preparer: Box<dyn StoragePreparer>,
    ) -> Self {
        Self {
            keys,
            weaver: Weaver::new(weaver),
            gatekeeper,
            preparer,
        }
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut KeyManager {
        &mut self.keys
    }

    /// Installs the device key and every user's DE key.
    pub fn decrypt_de(&mut self) -> std::result::Result<(), DecryptError> {
        self.keys.initialize_global_de().step(DecryptStep::DeviceKey)?;
        self.keys.init_user0().step(DecryptStep::UserDeKeys)
    }

    /// Unlocks `user_id` with `credential` and prepares its storage.
    ///
    /// On failure nothing is installed for the user.
    pub fn decrypt_user(
        &mut self,
        user_id: u32,
        credential: &[u8],
    ) -> std::result::Result<(), DecryptError> {
        if user_id > MAX_USER_ID {
            return Err::<(), _>(Error::Format(format!("user id {user_id} is too big")))
                .step(DecryptStep::ValidateUser);
        }

        let was_unlocked = self.keys.is_unlocked(user_id);
        if credential == DEFAULT_CREDENTIAL {
            info!(user_id, "unlocking with default credential");
            self.keys
                .unlock_user_key(user_id, &[], &[])
                .step(DecryptStep::UnlockKey)?;
        } else {
            let spblob_dir = self.keys.layout().spblob_dir(user_id);
            if spblob_dir.is_dir() {
                info!(user_id, "using synthetic password method");
                self.decrypt_synthetic(user_id, credential, &spblob_dir)?;
            } else {
                info!(user_id, "using legacy gatekeeper method");
                self.decrypt_legacy(user_id, credential)?;
            }
        }

        let prepared = self.prepare_storage(user_id);
        if prepared.is_err() && !was_unlocked {
            warn!(user_id, "storage preparation failed, evicting ce key");
            self.keys.evict_key(KeyKind::Ce, user_id);
        }
        prepared
    }

    fn decrypt_legacy(
        &mut self,
        user_id: u32,
        credential: &[u8],
    ) -> std::result::Result<(), DecryptError> {
        let (_, handle_path) = legacy_handle(self.keys.layout(), user_id)
            .ok_or_else(|| {
                Error::NotFound(format!("no gatekeeper handle for user {user_id}"))
            })
            .step(DecryptStep::LocateCredential)?;
        debug!(path = %handle_path.display(), "using gatekeeper handle");
        let handle = fs::read(&handle_path)
            .map_err(|e| Error::io(&handle_path, e))
            .step(DecryptStep::LocateCredential)?;

        let response = self
            .gatekeeper
            .verify(user_id, &handle, credential)
            .step(DecryptStep::VerifyCredential)?;
        let secret = crypto::personalized_hash(prefix::FBE_CREDENTIAL, credential);

        self.keys
            .unlock_user_key(user_id, &response.auth_token, &secret)
            .step(DecryptStep::UnlockKey)
    }

    fn decrypt_synthetic(
        &mut self,
        user_id: u32,
        credential: &[u8],
        spblob_dir: &Path,
    ) -> std::result::Result<(), DecryptError> {
        let handle = SpHandle::find(spblob_dir).step(DecryptStep::LocateCredential)?;
        let pwd = handle
            .password_data()
            .step(DecryptStep::LocateCredential)?;
        let token = pwd
            .password_token(credential)
            .step(DecryptStep::DerivePasswordToken)?;

        let unwrap_key = match handle.weaver_data().step(DecryptStep::LocateCredential)? {
            Some(data) => {
                debug!(slot = data.slot(), "using weaver");
                synthetic::weaver_factor(&self.weaver, &data, &token)
                    .step(DecryptStep::VerifyWeaver)?
            }
            None => {
                debug!("using secdiscardable");
                let secdis = handle
                    .secdiscardable()
                    .step(DecryptStep::LocateCredential)?;
                synthetic::secdiscardable_factor(
                    self.gatekeeper.as_ref(),
                    user_id,
                    &pwd,
                    &secdis,
                    &token,
                )
                .step(DecryptStep::VerifyCredential)?
            }
        };

        let blob = handle.blob().step(DecryptStep::LocateCredential)?;
        let keystore_dir = self.keys.layout().keystore_user_dir(user_id);
        let alias = synthetic::keystore_alias(&keystore_dir, handle.handle())
            .step(DecryptStep::LocateCredential)?;
        let secret = synthetic::unwrap_secret(self.keys.backend(), &alias, &blob, &unwrap_key)
            .step(DecryptStep::UnwrapSyntheticPassword)?;

        self.keys
            .unlock_user_key(user_id, &[], &secret)
            .step(DecryptStep::UnlockKey)
    }

    fn prepare_storage(&self, user_id: u32) -> std::result::Result<(), DecryptError> {
        // the primary user's storage is prepared as DE, others as CE
        self.preparer
            .prepare_user_storage(user_id, user_id == 0)
            .step(DecryptStep::PrepareStorage)?;
        info!(user_id, "decrypted successfully");
        Ok(())
    }

    /// Which kind of credential `user_id` has enrolled.
    pub fn password_type(&self, user_id: u32) -> PasswordType {
        password_type(self.keys.layout(), user_id)
    }
}

/// Which kind of credential `user_id` has enrolled, read from disk only.
pub fn password_type(layout: &DataLayout, user_id: u32) -> PasswordType {
    let spblob_dir = layout.spblob_dir(user_id);
    if spblob_dir.is_dir() {
        let kind = SpHandle::find(&spblob_dir).and_then(|h| h.password_data());
        return match kind.map(|pwd| pwd.kind()) {
            Ok(PasswordKind::Pattern) => PasswordType::Pattern,
            Ok(PasswordKind::PinOrPassword) => PasswordType::PinOrPassword,
            Ok(PasswordKind::Other(_)) => PasswordType::Unknown,
            Err(e) => {
                error!(user_id, error = %e, "cannot read password data");
                PasswordType::Unknown
            }
        };
    }
    legacy_handle(layout, user_id)
        .map(|(kind, _)| kind)
        .unwrap_or(PasswordType::Unknown)
}

fn non_empty_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Legacy gatekeeper handle file of a user, password before pattern.
fn legacy_handle(layout: &DataLayout, user_id: u32) -> Option<(PasswordType, PathBuf)> {
    [
        (
            PasswordType::PinOrPassword,
            layout.gatekeeper_password_key(user_id),
        ),
        (PasswordType::Pattern, layout.gatekeeper_pattern_key(user_id)),
    ]
    .into_iter()
    .find(|(_, path)| non_empty_file(path))
}
