//! Seams to the hardware collaborators: the key backend, the password
//! verifier and the secondary-factor verifier.
//!
//! Implementations are bound by the caller; this crate only depends on
//! the traits.

mod operation;
mod params;
mod unavailable;

pub use operation::KeyOperation;
pub use params::{AuthenticatorType, AuthorizationSet, KeyParam};
pub use unavailable::Unavailable;

use tracing::{debug, info};

use crate::{Error, KeyBuffer, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    Encrypt,
    Decrypt,
}

/// Backend-assigned id of an in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationHandle(pub u64);

/// Key material an operation runs with.
#[derive(Debug, Clone, Copy)]
pub enum KeySource<'a> {
    /// An opaque blob stored next to the envelope.
    Blob(&'a [u8]),
    /// A key already held by the platform key store under an alias.
    Alias(&'a str),
}

/// Hardware key backend.
///
/// One implementation exists per hardware generation; the caller picks
/// one with [`select_backend`].
pub trait KeyBackend {
    /// Hardware generation, higher is newer.
    fn version(&self) -> u32;

    /// Whether the hardware answers.
    fn is_available(&self) -> bool {
        true
    }

    /// Generates a key and returns its opaque blob.
    fn generate_key(&self, params: &AuthorizationSet) -> Result<Vec<u8>>;

    /// Starts an operation.
    ///
    /// Returns [`Error::KeyRequiresUpgrade`] when the blob was created by
    /// an older firmware and must go through [`KeyBackend::upgrade_key`].
    fn begin(
        &self,
        purpose: KeyPurpose,
        key: KeySource<'_>,
        params: &AuthorizationSet,
        auth_token: &[u8],
    ) -> Result<(OperationHandle, AuthorizationSet)>;

    /// Feeds input; returns how many bytes were consumed and any output.
    fn update(&self, op: OperationHandle, input: &[u8]) -> Result<(usize, KeyBuffer)>;

    fn finish(&self, op: OperationHandle) -> Result<KeyBuffer>;

    fn abort(&self, op: OperationHandle) -> Result<()>;

    fn delete_key(&self, blob: &[u8]) -> Result<()>;

    fn upgrade_key(&self, blob: &[u8], params: &AuthorizationSet) -> Result<Vec<u8>>;

    /// Generates a hardware-wrapped storage key.
    fn generate_wrapped_key(&self, params: &AuthorizationSet) -> Result<KeyBuffer>;

    /// Converts a hardware-wrapped key into its per-boot ephemeral form.
    fn export_ephemeral_key(&self, wrapped: &[u8]) -> Result<KeyBuffer>;
}

/// Picks the newest available backend.
pub fn select_backend(candidates: Vec<Box<dyn KeyBackend>>) -> Result<Box<dyn KeyBackend>> {
    let mut best: Option<Box<dyn KeyBackend>> = None;
    for backend in candidates {
        if !backend.is_available() {
            debug!(version = backend.version(), "key backend not available");
            continue;
        }
        if best.as_ref().is_none_or(|b| backend.version() > b.version()) {
            best = Some(backend);
        }
    }

    let backend = best.ok_or_else(|| Error::Hardware("no key backend available".into()))?;
    info!(version = backend.version(), "using key backend");
    Ok(backend)
}

/// Response of a successful password verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatekeeperResponse {
    pub auth_token: Vec<u8>,
    pub should_reenroll: bool,
}

/// Hardware password verifier issuing auth tokens.
pub trait Gatekeeper {
    /// Verifies `credential` against an enrolled `handle`.
    ///
    /// A mismatch is an error; [`Error::Throttled`] signals a retry delay.
    fn verify(&self, uid: u32, handle: &[u8], credential: &[u8]) -> Result<GatekeeperResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeaverConfig {
    pub slots: u32,
    pub key_size: u32,
    pub value_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeaverStatus {
    Ok,
    Failed,
    IncorrectKey,
    Throttle,
}

#[derive(Debug)]
pub struct WeaverReadResponse {
    pub status: WeaverStatus,
    pub payload: KeyBuffer,
    pub timeout_secs: u32,
}

/// Hardware secondary-factor verifier.
pub trait WeaverDevice {
    fn config(&self) -> Result<WeaverConfig>;
    fn read(&self, slot: u32, key: &[u8]) -> Result<WeaverReadResponse>;
}

impl<T: WeaverDevice + ?Sized> WeaverDevice for Box<T> {
    fn config(&self) -> Result<WeaverConfig> {
        (**self).config()
    }

    fn read(&self, slot: u32, key: &[u8]) -> Result<WeaverReadResponse> {
        (**self).read(slot, key)
    }
}

/// Length of a hardware auth token.
pub const AUTH_TOKEN_LEN: usize = 69;
const AUTH_TOKEN_USER_ID: std::ops::Range<usize> = 9..17;

/// Extracts the secure user id from a hardware auth token.
pub fn auth_token_user_id(token: &[u8]) -> Result<u64> {
    if token.len() != AUTH_TOKEN_LEN {
        return Err(Error::Format(format!(
            "auth token is {} bytes, expected {AUTH_TOKEN_LEN}",
            token.len()
        )));
    }
    let id: [u8; 8] = token[AUTH_TOKEN_USER_ID]
        .try_into()
        .map_err(|_| Error::Format("auth token user id".into()))?;
    Ok(u64::from_le_bytes(id))
}
