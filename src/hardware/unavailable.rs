use super::{
    AuthorizationSet, Gatekeeper, GatekeeperResponse, KeyBackend, KeyPurpose, KeySource,
    OperationHandle, WeaverConfig, WeaverDevice, WeaverReadResponse,
};
use crate::{Error, KeyBuffer, Result};

/// Stand-in for a hardware service this build has no binding for.
///
/// Availability checks report it as unavailable and every call fails with
/// [`Error::Hardware`].
#[derive(Debug, Clone, Copy)]
pub struct Unavailable {
    service: &'static str,
}

impl Unavailable {
    pub const fn new(service: &'static str) -> Self {
        Self { service }
    }

    fn err<T>(&self) -> Result<T> {
        Err(Error::Hardware(format!("{} is not available", self.service)))
    }
}

impl KeyBackend for Unavailable {
    fn version(&self) -> u32 {
        0
    }

    fn is_available(&self) -> bool {
        false
    }

    fn generate_key(&self, _: &AuthorizationSet) -> Result<Vec<u8>> {
        self.err()
    }

    fn begin(
        &self,
        _: KeyPurpose,
        _: KeySource<'_>,
        _: &AuthorizationSet,
        _: &[u8],
    ) -> Result<(OperationHandle, AuthorizationSet)> {
        self.err()
    }

    fn update(&self, _: OperationHandle, _: &[u8]) -> Result<(usize, KeyBuffer)> {
        self.err()
    }

    fn finish(&self, _: OperationHandle) -> Result<KeyBuffer> {
        self.err()
    }

    fn abort(&self, _: OperationHandle) -> Result<()> {
        self.err()
    }

    fn delete_key(&self, _: &[u8]) -> Result<()> {
        self.err()
    }

    fn upgrade_key(&self, _: &[u8], _: &AuthorizationSet) -> Result<Vec<u8>> {
        self.err()
    }

    fn generate_wrapped_key(&self, _: &AuthorizationSet) -> Result<KeyBuffer> {
        self.err()
    }

    fn export_ephemeral_key(&self, _: &[u8]) -> Result<KeyBuffer> {
        self.err()
    }
}

impl Gatekeeper for Unavailable {
    fn verify(&self, _: u32, _: &[u8], _: &[u8]) -> Result<GatekeeperResponse> {
        self.err()
    }
}

impl WeaverDevice for Unavailable {
    fn config(&self) -> Result<WeaverConfig> {
        self.err()
    }

    fn read(&self, _: u32, _: &[u8]) -> Result<WeaverReadResponse> {
        self.err()
    }
}
