use std::fmt;
use std::str::FromStr;

use tracing::warn;

use super::STRETCHED_LEN;
use crate::{Error, KeyBuffer, Result};

/// Largest scrypt working set accepted, in bytes.
const MAX_SCRYPT_MEMORY: u128 = 1 << 30;

/// scrypt cost parameters stored as base-2 exponents.
///
/// `"15:3:1"` means `N = 1 << 15`, `r = 1 << 3`, `p = 1 << 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScryptParams {
    log_n: u8,
    log_r: u8,
    log_p: u8,
}

impl Default for ScryptParams {
    fn default() -> Self {
        Self {
            log_n: 15,
            log_r: 3,
            log_p: 1,
        }
    }
}

impl ScryptParams {
    pub fn new(log_n: u8, log_r: u8, log_p: u8) -> Self {
        Self {
            log_n,
            log_r,
            log_p,
        }
    }

    pub fn log_n(&self) -> u8 {
        self.log_n
    }

    pub fn log_r(&self) -> u8 {
        self.log_r
    }

    pub fn log_p(&self) -> u8 {
        self.log_p
    }

    /// Bytes scrypt allocates for these parameters: `128 * r * (N + p)`.
    fn memory_cost(&self) -> Option<u128> {
        let n = 1u128.checked_shl(self.log_n.into())?;
        let r = 1u128.checked_shl(self.log_r.into())?;
        let p = 1u128.checked_shl(self.log_p.into())?;
        128u128.checked_mul(r)?.checked_mul(n.checked_add(p)?)
    }

    /// Runs scrypt with these parameters and writes `out.len()` bytes.
    ///
    /// A working set above 1 GiB is refused with [`Error::Crypto`] before
    /// anything is allocated.
    pub fn derive(&self, password: &[u8], salt: &[u8], out: &mut [u8]) -> Result<()> {
        match self.memory_cost() {
            Some(bytes) if bytes <= MAX_SCRYPT_MEMORY => {}
            _ => {
                return Err(Error::Crypto(format!(
                    "scrypt parameters {self} exceed the memory limit"
                )));
            }
        }

        let r = 1u32
            .checked_shl(self.log_r.into())
            .ok_or_else(|| Error::Crypto(format!("scrypt r exponent {} too large", self.log_r)))?;
        let p = 1u32
            .checked_shl(self.log_p.into())
            .ok_or_else(|| Error::Crypto(format!("scrypt p exponent {} too large", self.log_p)))?;

        let params = scrypt::Params::new(self.log_n, r, p, out.len())
            .map_err(|e| Error::Crypto(format!("invalid scrypt parameters: {e}")))?;

        scrypt::scrypt(password, salt, &params, out)
            .map_err(|e| Error::Crypto(format!("scrypt failed: {e}")))
    }
}

impl FromStr for ScryptParams {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != 3 {
            return Err(Error::Format(format!(
                "expected three scrypt parameters, got {s:?}"
            )));
        }

        let parse = |f: &str| {
            f.parse::<u8>()
                .map_err(|_| Error::Format(format!("bad scrypt parameter {f:?}")))
        };

        Ok(Self::new(parse(fields[0])?, parse(fields[1])?, parse(fields[2])?))
    }
}

impl fmt::Display for ScryptParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.log_n, self.log_r, self.log_p)
    }
}

/// Credential stretching recorded in an envelope directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stretching {
    /// The secret is used as-is.
    None,
    /// The key is not protected by a secret.
    NoPassword,
    Scrypt(ScryptParams),
}

impl FromStr for Stretching {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Stretching::None),
            "nopassword" => Ok(Stretching::NoPassword),
            _ => match s.strip_prefix("scrypt ") {
                Some(params) => Ok(Stretching::Scrypt(params.parse()?)),
                None => Err(Error::Format(format!("unknown stretching {s:?}"))),
            },
        }
    }
}

impl fmt::Display for Stretching {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stretching::None => f.write_str("none"),
            Stretching::NoPassword => f.write_str("nopassword"),
            Stretching::Scrypt(params) => write!(f, "scrypt {params}"),
        }
    }
}

/// Only scrypt stretching persists a salt.
pub fn stretching_needs_salt(stretching: &Stretching) -> bool {
    matches!(stretching, Stretching::Scrypt(_))
}

/// Stretches `secret` according to `stretching`.
pub fn stretch(stretching: &Stretching, secret: &[u8], salt: &[u8]) -> Result<KeyBuffer> {
    match stretching {
        Stretching::None => Ok(KeyBuffer::from_slice(secret)),
        Stretching::NoPassword => {
            if !secret.is_empty() {
                warn!("password present but stretching is nopassword");
            }
            Ok(KeyBuffer::default())
        }
        Stretching::Scrypt(params) => {
            let mut out = KeyBuffer::zeroed(STRETCHED_LEN);
            params.derive(secret, salt, out.as_mut_slice())?;
            Ok(out)
        }
    }
}
