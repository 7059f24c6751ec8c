//! Envelope key storage.
//!
//! A key lives in a directory of separate files:
//!
//! ```text
//! version             "1"
//! secdiscardable      16 KiB of random bytes anchoring the application id
//! stretching          "none" | "nopassword" | "scrypt N:r:p"
//! salt                16 bytes, only for scrypt stretching
//! keymaster_key_blob  hardware wrapping key, only on the hardware path
//! encrypted_key       NONCE (12) | BODY | TAG (16)
//! ```
//!
//! The application id is `H(secdiscardable) ‖ stretch(secret)`. On the
//! hardware path it is bound into the wrapping key; on the software path
//! it is hashed into an AES-256-GCM key.

use std::fmt;
use std::fs;
use std::path::Path;

use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{
    self, AES_KEY_LEN, GCM_MAC_LEN, GCM_NONCE_LEN, SALT_LEN, ScryptParams, Stretching, prefix,
};
use crate::hardware::{
    AuthenticatorType, AuthorizationSet, KeyBackend, KeyOperation, KeyParam, KeyPurpose, KeySource,
    auth_token_user_id,
};
use crate::platform::SecureDiscard;
use crate::storage::{self, KeyDirectory};
use crate::{Capabilities, Error, KeyBuffer, Result};

pub const CURRENT_VERSION: &str = "1";
pub const SECDISCARDABLE_LEN: usize = 1 << 14;
const AUTH_TIMEOUT_SECS: u32 = 30;

const FN_VERSION: &str = "version";
const FN_SECDISCARDABLE: &str = "secdiscardable";
const FN_STRETCHING: &str = "stretching";
const FN_SALT: &str = "salt";
const FN_KEY_BLOB: &str = "keymaster_key_blob";
const FN_ENCRYPTED_KEY: &str = "encrypted_key";

/// What a caller presents to unlock an envelope.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct KeyAuthentication {
    token: Zeroizing<Vec<u8>>,
    secret: Zeroizing<Vec<u8>>,
}

impl KeyAuthentication {
    pub fn new(token: &[u8], secret: &[u8]) -> Self {
        Self {
            token: Zeroizing::new(token.to_vec()),
            secret: Zeroizing::new(secret.to_vec()),
        }
    }

    /// No token and no secret: the key is only bound to the device.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Software-only stretching is used only with a secret and no token.
    pub fn uses_hardware(&self) -> bool {
        !self.token.is_empty() || self.secret.is_empty()
    }
}

impl fmt::Debug for KeyAuthentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyAuthentication")
            .field("token", &format_args!("[REDACTED; {}]", self.token.len()))
            .field("secret", &format_args!("[REDACTED; {}]", self.secret.len()))
            .finish()
    }
}

pub fn path_exists(path: &Path) -> bool {
    path.exists()
}

fn choose_stretching(auth: &KeyAuthentication, scrypt: ScryptParams) -> Stretching {
    if !auth.uses_hardware() {
        Stretching::None
    } else if auth.secret().is_empty() {
        Stretching::NoPassword
    } else {
        Stretching::Scrypt(scrypt)
    }
}

fn hash_secdiscardable(secdiscardable: &[u8]) -> KeyBuffer {
    crypto::personalized_hash(prefix::SECDISCARDABLE, secdiscardable)
}

fn application_id(
    auth: &KeyAuthentication,
    stretching: &Stretching,
    salt: &[u8],
    secdiscardable_hash: &[u8],
) -> Result<KeyBuffer> {
    let stretched = crypto::stretch(stretching, auth.secret(), salt)?;
    Ok(KeyBuffer::concat(secdiscardable_hash, &stretched))
}

fn key_params(auth: &KeyAuthentication, app_id: &[u8]) -> Result<AuthorizationSet> {
    let mut params = AuthorizationSet::aes_encryption_key((AES_KEY_LEN * 8) as u32)
        .gcm_mode_min_mac((GCM_MAC_LEN * 8) as u32)
        .with(KeyParam::ApplicationId(Zeroizing::new(app_id.to_vec())));

    if auth.token().is_empty() {
        debug!("creating key that doesn't need auth token");
        params.push(KeyParam::NoAuthRequired);
    } else {
        debug!("auth token required for key");
        params.push(KeyParam::UserSecureId(auth_token_user_id(auth.token())?));
        params.push(KeyParam::UserAuthType(AuthenticatorType::Password));
        params.push(KeyParam::AuthTimeout(AUTH_TIMEOUT_SECS));
    }
    Ok(params)
}

fn begin_params(app_id: &[u8]) -> AuthorizationSet {
    AuthorizationSet::gcm_operation((GCM_MAC_LEN * 8) as u32)
        .with(KeyParam::ApplicationId(Zeroizing::new(app_id.to_vec())))
}

/// Begins an operation on the blob stored in `dir`, upgrading the blob in
/// memory when the backend asks for it.
fn begin<'a>(
    backend: &'a dyn KeyBackend,
    dir: &KeyDirectory,
    purpose: KeyPurpose,
    params: &AuthorizationSet,
    auth_token: &[u8],
) -> Result<KeyOperation<'a>> {
    let mut blob = dir.read(FN_KEY_BLOB)?;
    let mut upgraded = false;
    loop {
        match KeyOperation::begin(backend, purpose, KeySource::Blob(&blob), params, auth_token) {
            Err(Error::KeyRequiresUpgrade) if !upgraded => {
                debug!(path = %dir.path().display(), "upgrading key in memory only");
                blob = backend.upgrade_key(&blob, params)?;
                upgraded = true;
            }
            other => return other,
        }
    }
}

fn encrypt_with_hardware(
    backend: &dyn KeyBackend,
    dir: &KeyDirectory,
    auth: &KeyAuthentication,
    app_id: &[u8],
    key: &[u8],
) -> Result<Vec<u8>> {
    let mut op = begin(
        backend,
        dir,
        KeyPurpose::Encrypt,
        &begin_params(app_id),
        auth.token(),
    )?;

    let nonce = op
        .out_params()
        .nonce()
        .ok_or_else(|| Error::Hardware("GCM encryption but no nonce generated".into()))?
        .to_vec();
    check_size("nonce", nonce.len(), GCM_NONCE_LEN)?;

    let mut body = KeyBuffer::default();
    op.update_completely(key, &mut body)?;

    let mut mac = KeyBuffer::default();
    op.finish(&mut mac)?;
    check_size("mac", mac.len(), GCM_MAC_LEN)?;

    let mut out = nonce;
    out.extend_from_slice(&body);
    out.extend_from_slice(&mac);
    Ok(out)
}

fn decrypt_with_hardware(
    backend: &dyn KeyBackend,
    dir: &KeyDirectory,
    auth: &KeyAuthentication,
    app_id: &[u8],
    ciphertext: &[u8],
) -> Result<KeyBuffer> {
    if ciphertext.len() < GCM_NONCE_LEN + GCM_MAC_LEN {
        return Err(Error::Crypto(format!(
            "GCM ciphertext too small: {}",
            ciphertext.len()
        )));
    }
    let (nonce, body_and_mac) = ciphertext.split_at(GCM_NONCE_LEN);
    let params = begin_params(app_id).with(KeyParam::Nonce(nonce.to_vec()));

    let mut op = begin(backend, dir, KeyPurpose::Decrypt, &params, auth.token())?;
    let mut key = KeyBuffer::default();
    op.update_completely(body_and_mac, &mut key)?;
    op.finish(&mut key)?;
    Ok(key)
}

fn software_key(app_id: &[u8]) -> KeyBuffer {
    let mut key = crypto::personalized_hash(prefix::KEY_WRAPPING, app_id);
    key.resize(AES_KEY_LEN);
    key
}

fn check_size(kind: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(Error::Hardware(format!(
            "{kind} should be {expected} bytes, was {actual}"
        )));
    }
    Ok(())
}

/// Writes `key` into a fresh envelope directory at `path`.
pub fn store_key(
    path: &Path,
    auth: &KeyAuthentication,
    key: &KeyBuffer,
    backend: &dyn KeyBackend,
    caps: &Capabilities,
) -> Result<()> {
    let dir = KeyDirectory::new(path);
    dir.create()?;
    dir.write(FN_VERSION, CURRENT_VERSION.as_bytes())?;

    let secdiscardable = KeyBuffer::random(SECDISCARDABLE_LEN)?;
    dir.write(FN_SECDISCARDABLE, &secdiscardable)?;
    let secdiscardable_hash = hash_secdiscardable(&secdiscardable);

    let stretching = choose_stretching(auth, caps.scrypt_params);
    dir.write(FN_STRETCHING, stretching.to_string().as_bytes())?;

    let salt = if crypto::stretching_needs_salt(&stretching) {
        let salt = KeyBuffer::random(SALT_LEN)?;
        dir.write(FN_SALT, &salt)?;
        salt
    } else {
        KeyBuffer::default()
    };

    let app_id = application_id(auth, &stretching, &salt, &secdiscardable_hash)?;

    let encrypted = if auth.uses_hardware() {
        let blob = backend.generate_key(&key_params(auth, &app_id)?)?;
        dir.write(FN_KEY_BLOB, &blob)?;
        encrypt_with_hardware(backend, &dir, auth, &app_id, key)?
    } else {
        crypto::encrypt(&software_key(&app_id), key)?
    };
    dir.write(FN_ENCRYPTED_KEY, &encrypted)
}

/// Stores `key` under `tmp_path`, then renames it onto `key_path`.
///
/// Fails if `key_path` already exists. A stale `tmp_path` from an earlier
/// crash is destroyed first.
pub fn store_key_atomically(
    key_path: &Path,
    tmp_path: &Path,
    auth: &KeyAuthentication,
    key: &KeyBuffer,
    backend: &dyn KeyBackend,
    discard: &dyn SecureDiscard,
    caps: &Capabilities,
) -> Result<()> {
    if path_exists(key_path) {
        error!(path = %key_path.display(), "already exists, cannot create key");
        return Err(Error::AlreadyExists(key_path.to_path_buf()));
    }
    if path_exists(tmp_path) {
        debug!(path = %tmp_path.display(), "already exists, destroying");
        // may be partially created
        let _ = destroy_key(tmp_path, backend, discard);
    }

    store_key(tmp_path, auth, key, backend, caps)?;
    storage::rename_dir(tmp_path, key_path)?;
    info!(path = %key_path.display(), "created key");
    Ok(())
}

/// Recovers the key stored in `path`.
///
/// Fails closed: any mismatch between `auth` and the envelope is an error.
pub fn retrieve_key(
    path: &Path,
    auth: &KeyAuthentication,
    backend: &dyn KeyBackend,
) -> Result<KeyBuffer> {
    let dir = KeyDirectory::new(path);

    let version = dir.read_string(FN_VERSION)?;
    if version != CURRENT_VERSION {
        error!(expected = CURRENT_VERSION, got = %version, "version mismatch");
        return Err(Error::VersionMismatch {
            expected: CURRENT_VERSION.into(),
            found: version,
        });
    }

    let secdiscardable_hash = hash_secdiscardable(&Zeroizing::new(dir.read(FN_SECDISCARDABLE)?));
    let stretching: Stretching = dir.read_string(FN_STRETCHING)?.parse()?;
    let salt = if crypto::stretching_needs_salt(&stretching) {
        dir.read(FN_SALT)?
    } else {
        Vec::new()
    };

    let app_id = application_id(auth, &stretching, &salt, &secdiscardable_hash)?;
    let encrypted = dir.read(FN_ENCRYPTED_KEY)?;

    if auth.uses_hardware() {
        decrypt_with_hardware(backend, &dir, auth, &app_id, &encrypted)
    } else {
        crypto::decrypt(&software_key(&app_id), &encrypted)
    }
}

/// Best-effort destruction of an envelope directory.
///
/// Every step is attempted; the result is `true` only if all succeeded.
pub fn destroy_key(path: &Path, backend: &dyn KeyBackend, discard: &dyn SecureDiscard) -> bool {
    let dir = KeyDirectory::new(path);
    let mut success = true;

    if dir.has(FN_KEY_BLOB) {
        let deleted = dir
            .read(FN_KEY_BLOB)
            .and_then(|blob| backend.delete_key(&blob));
        if let Err(e) = deleted {
            warn!(path = %path.display(), error = %e, "failed to delete hardware key");
            success = false;
        }
    }

    let files: Vec<_> = [FN_ENCRYPTED_KEY, FN_SECDISCARDABLE, FN_KEY_BLOB]
        .iter()
        .map(|f| dir.file(f))
        .filter(|f| f.exists())
        .collect();
    if !discard.secure_discard(&files) {
        warn!(path = %path.display(), "secure discard failed");
        success = false;
    }

    if let Err(e) = fs::remove_dir_all(path) {
        warn!(path = %path.display(), error = %e, "failed to delete key directory");
        success = false;
    }

    success
}
