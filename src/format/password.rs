//! `<handle>.pwd` record.
//!
//! ```text
//! TYPE (i32) | SCRYPT_N (1) | SCRYPT_R (1) | SCRYPT_P (1) | SALT_LEN (i32) | SALT | [HANDLE_LEN (i32) | HANDLE]
//! ```
//!
//! The scrypt costs are exponents.

use super::{Cursor, INT_LEN};
use crate::crypto::ScryptParams;
use crate::{Error, KeyBuffer, Result};

/// Output length of the password token.
pub const PASSWORD_TOKEN_LEN: usize = 32;

/// Credential kind recorded by the lock settings service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordKind {
    Pattern,
    PinOrPassword,
    /// No credential set, or a type this crate does not know.
    Other(i32),
}

impl From<i32> for PasswordKind {
    fn from(v: i32) -> Self {
        match v {
            1 => PasswordKind::Pattern,
            2 => PasswordKind::PinOrPassword,
            other => PasswordKind::Other(other),
        }
    }
}

impl From<PasswordKind> for i32 {
    fn from(kind: PasswordKind) -> Self {
        match kind {
            PasswordKind::Pattern => 1,
            PasswordKind::PinOrPassword => 2,
            PasswordKind::Other(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordData {
    kind: PasswordKind,
    scrypt: ScryptParams,
    salt: Vec<u8>,
    handle: Vec<u8>,
}

impl PasswordData {
    pub fn new(kind: PasswordKind, scrypt: ScryptParams, salt: Vec<u8>, handle: Vec<u8>) -> Self {
        Self {
            kind,
            scrypt,
            salt,
            handle,
        }
    }

    pub fn kind(&self) -> PasswordKind {
        self.kind
    }

    pub fn scrypt(&self) -> ScryptParams {
        self.scrypt
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Gatekeeper handle; empty when the credential is protected by weaver.
    pub fn handle(&self) -> &[u8] {
        &self.handle
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(data, "password data");

        let kind = PasswordKind::from(c.i32_be()?);
        let scrypt = ScryptParams::new(c.u8()?, c.u8()?, c.u8()?);

        let salt = c.length_prefixed()?.to_vec();
        if salt.is_empty() {
            return Err(Error::Format("password data salt is empty".into()));
        }

        let handle = if c.remaining() >= INT_LEN {
            c.length_prefixed()?.to_vec()
        } else {
            Vec::new()
        };

        Ok(Self::new(kind, scrypt, salt, handle))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 * INT_LEN + 3 + self.salt.len() + self.handle.len());
        buf.extend_from_slice(&i32::from(self.kind).to_be_bytes());
        buf.push(self.scrypt.log_n());
        buf.push(self.scrypt.log_r());
        buf.push(self.scrypt.log_p());
        buf.extend_from_slice(&(self.salt.len() as i32).to_be_bytes());
        buf.extend_from_slice(&self.salt);
        buf.extend_from_slice(&(self.handle.len() as i32).to_be_bytes());
        buf.extend_from_slice(&self.handle);
        buf
    }

    /// Stretches the credential into the 32-byte password token.
    pub fn password_token(&self, credential: &[u8]) -> Result<KeyBuffer> {
        let mut token = KeyBuffer::zeroed(PASSWORD_TOKEN_LEN);
        self.scrypt
            .derive(credential, &self.salt, token.as_mut_slice())?;
        Ok(token)
    }
}
