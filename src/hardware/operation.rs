use tracing::warn;

use super::{AuthorizationSet, KeyBackend, KeyPurpose, KeySource, OperationHandle};
use crate::{Error, KeyBuffer, Result};

/// An in-flight backend operation.
///
/// Dropping an unfinished operation aborts it. `finish` consumes the
/// guard, so an operation can be finished at most once.
pub struct KeyOperation<'a> {
    backend: &'a dyn KeyBackend,
    handle: Option<OperationHandle>,
    out_params: AuthorizationSet,
}

impl<'a> KeyOperation<'a> {
    pub fn begin(
        backend: &'a dyn KeyBackend,
        purpose: KeyPurpose,
        key: KeySource<'_>,
        params: &AuthorizationSet,
        auth_token: &[u8],
    ) -> Result<Self> {
        let (handle, out_params) = backend.begin(purpose, key, params, auth_token)?;
        Ok(Self {
            backend,
            handle: Some(handle),
            out_params,
        })
    }

    /// Parameters returned by the backend when the operation began.
    pub fn out_params(&self) -> &AuthorizationSet {
        &self.out_params
    }

    fn handle(&self) -> Result<OperationHandle> {
        self.handle
            .ok_or_else(|| Error::Hardware("operation already closed".into()))
    }

    /// Feeds all of `input`, appending produced bytes to `output`.
    pub fn update_completely(&mut self, input: &[u8], output: &mut KeyBuffer) -> Result<()> {
        let handle = self.handle()?;
        let mut offset = 0;
        while offset < input.len() {
            let (consumed, chunk) = self.backend.update(handle, &input[offset..])?;
            if consumed == 0 || consumed > input.len() - offset {
                return Err(Error::Hardware(format!(
                    "update consumed {consumed} of {} bytes",
                    input.len() - offset
                )));
            }
            output.extend_from_slice(&chunk);
            offset += consumed;
        }
        Ok(())
    }

    pub fn finish(mut self, output: &mut KeyBuffer) -> Result<()> {
        let handle = self.handle()?;
        self.handle = None;
        let tail = self.backend.finish(handle)?;
        output.extend_from_slice(&tail);
        Ok(())
    }
}

impl Drop for KeyOperation<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.backend.abort(handle) {
                warn!(error = %e, "failed to abort key operation");
            }
        }
    }
}
