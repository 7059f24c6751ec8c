//! Synthetic-password chain: from a presented credential to the secret
//! protecting the user's CE key.
//!
//! The files for one credential share a handle name inside the user's
//! `spblob` directory:
//!
//! ```text
//! <handle>.pwd      password data (scrypt parameters, salt, handle)
//! <handle>.weaver   weaver slot, when a weaver protects the credential
//! <handle>.secdis   secdiscardable bytes, when it does not
//! <handle>.spblob   the wrapped synthetic password
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::crypto::{self, AES_KEY_LEN, GCM_MAC_LEN, GCM_NONCE_LEN, prefix};
use crate::format::{PasswordData, SpBlob, SpBlobVersion, WeaverData};
use crate::hardware::{
    AuthorizationSet, Gatekeeper, KeyBackend, KeyOperation, KeyParam, KeyPurpose, KeySource,
    WeaverDevice,
};
use crate::weaver::Weaver;
use crate::{Error, KeyBuffer, Result};

pub const SYNTHETIC_PASSWORD_KEY_PREFIX: &str = "USRSKEY_synthetic_password_";
pub const USER_PRIVATE_KEY_PREFIX: &str = "USRPKEY_synthetic_password_";

/// Gatekeeper uid offset for synthetic-password enrolments.
const FAKE_UID_BASE: u32 = 100_000;

/// The files of one enrolled credential.
#[derive(Debug, Clone)]
pub struct SpHandle {
    dir: PathBuf,
    handle: String,
}

impl SpHandle {
    /// Finds the single `<handle>.pwd` file in `dir`.
    pub fn find(dir: &Path) -> Result<Self> {
        let entries = fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
        let mut handles = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(dir, e))?;
            if let Some(handle) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(".pwd"))
                .filter(|h| !h.is_empty())
            {
                handles.push(handle.to_owned());
            }
        }

        match handles.len() {
            0 => Err(Error::NotFound(format!(
                "no password data in {}",
                dir.display()
            ))),
            1 => {
                let handle = handles.remove(0);
                info!(handle = %handle, "found password handle");
                Ok(Self {
                    dir: dir.to_path_buf(),
                    handle,
                })
            }
            n => Err(Error::Format(format!(
                "{n} password data files in {}, expected one",
                dir.display()
            ))),
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn file(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{ext}", self.handle))
    }

    fn read(&self, ext: &str) -> Result<Vec<u8>> {
        let path = self.file(ext);
        fs::read(&path).map_err(|e| Error::io(path, e))
    }

    pub fn password_data(&self) -> Result<PasswordData> {
        PasswordData::from_bytes(&self.read("pwd")?)
    }

    /// `None` when the credential is not weaver-protected.
    pub fn weaver_data(&self) -> Result<Option<WeaverData>> {
        if !self.file("weaver").exists() {
            return Ok(None);
        }
        WeaverData::from_bytes(&self.read("weaver")?).map(Some)
    }

    pub fn secdiscardable(&self) -> Result<KeyBuffer> {
        self.read("secdis").map(KeyBuffer::new)
    }

    pub fn blob(&self) -> Result<SpBlob> {
        SpBlob::from_bytes(&self.read("spblob")?)
    }
}

/// Key material for unwrapping the synthetic password blob.
#[derive(Debug)]
pub struct UnwrapKey {
    application_id: KeyBuffer,
    auth_token: Vec<u8>,
}

impl UnwrapKey {
    pub fn new(application_id: KeyBuffer, auth_token: Vec<u8>) -> Self {
        Self {
            application_id,
            auth_token,
        }
    }

    pub fn application_id(&self) -> &[u8] {
        &self.application_id
    }

    /// Hardware auth token for the key store, empty on the weaver path.
    pub fn auth_token(&self) -> &[u8] {
        &self.auth_token
    }
}

/// Second factor held by a weaver slot.
///
/// The weaver is consulted before any key store operation, so a wrong
/// credential is rejected by the throttled hardware first.
pub fn weaver_factor<D: WeaverDevice>(
    weaver: &Weaver<D>,
    data: &WeaverData,
    password_token: &[u8],
) -> Result<UnwrapKey> {
    let weaver_key = crypto::personalized_hash(prefix::WEAVER_KEY, password_token);
    let payload = weaver.verify(data.slot(), &weaver_key)?;
    debug!(slot = data.slot(), "weaver verified");

    let weaver_secret = crypto::personalized_hash(prefix::WEAVER_PASSWORD, &payload);
    Ok(UnwrapKey::new(
        KeyBuffer::concat(password_token, &weaver_secret),
        Vec::new(),
    ))
}

/// Second factor held by a secdiscardable file, gated by the gatekeeper.
pub fn secdiscardable_factor(
    gatekeeper: &dyn Gatekeeper,
    user_id: u32,
    pwd: &PasswordData,
    secdiscardable: &[u8],
    password_token: &[u8],
) -> Result<UnwrapKey> {
    if pwd.handle().is_empty() {
        return Err(Error::Format("no password handle supplied".into()));
    }
    let gk_credential = crypto::personalized_hash(prefix::USER_GK_AUTH, password_token);
    let response = gatekeeper.verify(FAKE_UID_BASE + user_id, pwd.handle(), &gk_credential)?;
    if response.should_reenroll {
        debug!(user_id, "gatekeeper requests re-enrolment");
    }

    let transformed = crypto::personalized_hash(prefix::SECDISCARDABLE_TRANSFORM, secdiscardable);
    Ok(UnwrapKey::new(
        KeyBuffer::concat(password_token, &transformed),
        response.auth_token,
    ))
}

/// Finds the key store alias wrapping the synthetic password.
///
/// Private-key aliases win over secret-key ones. The alias id is usually
/// the handle without leading zeros; otherwise the last `_` field of a
/// matching file name is taken.
pub fn keystore_alias(keystore_dir: &Path, handle: &str) -> Result<String> {
    let entries = fs::read_dir(keystore_dir).map_err(|e| Error::io(keystore_dir, e))?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();

    let handle_sub = handle.trim_start_matches('0');
    let mut key_prefix = None;
    let mut sub_id = None;
    let mut has_private = false;

    for name in &names {
        if name.len() <= SYNTHETIC_PASSWORD_KEY_PREFIX.len() {
            continue;
        }
        if name.contains(SYNTHETIC_PASSWORD_KEY_PREFIX) && !has_private {
            key_prefix = Some(SYNTHETIC_PASSWORD_KEY_PREFIX);
        } else if name.contains(USER_PRIVATE_KEY_PREFIX) {
            key_prefix = Some(USER_PRIVATE_KEY_PREFIX);
            has_private = true;
        } else {
            continue;
        }

        if !handle_sub.is_empty() && name.contains(handle_sub) {
            sub_id = Some(handle_sub.to_owned());
            break;
        }
        if let Some((_, last)) = name.rsplit_once('_') {
            debug!(sub_id = last, "possible keystore id");
            sub_id = Some(last.to_owned());
        }
    }

    match (key_prefix, sub_id) {
        (Some(prefix), Some(id)) => Ok(format!("{prefix}{id}")),
        _ => Err(Error::NotFound(format!(
            "no synthetic password key in {}",
            keystore_dir.display()
        ))),
    }
}

fn hardware_decrypt(
    backend: &dyn KeyBackend,
    alias: &str,
    nonce: &[u8],
    body: &[u8],
    auth_token: &[u8],
) -> Result<KeyBuffer> {
    let params = AuthorizationSet::new()
        .with(KeyParam::AlgorithmAes)
        .with(KeyParam::BlockModeGcm)
        .with(KeyParam::PaddingNone)
        .with(KeyParam::Nonce(nonce.to_vec()))
        .with(KeyParam::MacLength((GCM_MAC_LEN * 8) as u32));

    let mut op = KeyOperation::begin(
        backend,
        KeyPurpose::Decrypt,
        KeySource::Alias(alias),
        &params,
        auth_token,
    )?;
    let mut out = KeyBuffer::default();
    op.update_completely(body, &mut out)?;
    op.finish(&mut out)?;
    Ok(out)
}

fn split_nonce(data: &[u8]) -> Result<(&[u8], &[u8])> {
    if data.len() < GCM_NONCE_LEN + GCM_MAC_LEN {
        return Err(Error::Crypto(format!(
            "intermediate key too short: {} bytes",
            data.len()
        )));
    }
    Ok(data.split_at(GCM_NONCE_LEN))
}

/// Unwraps the synthetic password and derives the disk secret from it.
///
/// Version 1 blobs are software-decrypted first and hardware-decrypted
/// second; later versions reverse the order.
pub fn unwrap_secret(
    backend: &dyn KeyBackend,
    alias: &str,
    blob: &SpBlob,
    key: &UnwrapKey,
) -> Result<KeyBuffer> {
    let hashed_id = crypto::personalized_hash(prefix::APPLICATION_ID, key.application_id());
    let software_key = &hashed_id[..AES_KEY_LEN];

    let synthetic_password = match blob.version() {
        SpBlobVersion::V1 => {
            let intermediate = crypto::decrypt_parts(software_key, blob.nonce(), blob.ciphertext())?;
            let (nonce, body) = split_nonce(&intermediate)?;
            hardware_decrypt(backend, alias, nonce, body, key.auth_token())?
        }
        SpBlobVersion::V2 | SpBlobVersion::V3 => {
            let intermediate =
                hardware_decrypt(backend, alias, blob.nonce(), blob.ciphertext(), key.auth_token())?;
            crypto::decrypt(software_key, &intermediate)?
        }
    };
    debug!(version = ?blob.version(), "synthetic password unwrapped");

    match blob.version() {
        SpBlobVersion::V3 => crypto::sp800_derive(
            &synthetic_password,
            prefix::FBE_KEY.as_bytes(),
            prefix::PERSONALIZATION_CONTEXT.as_bytes(),
        ),
        SpBlobVersion::V1 | SpBlobVersion::V2 => {
            Ok(crypto::personalized_hash(prefix::FBE_KEY, &synthetic_password))
        }
    }
}
