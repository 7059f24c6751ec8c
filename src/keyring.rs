//! Installation of raw keys into the kernel key registry.
//!
//! Each key is added once per filesystem alias as a `logon` key named
//! `<alias>:<hex raw ref>`, so ext4, f2fs and the generic fscrypt code all
//! find it.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha512};
use tracing::{debug, error};

use crate::{Capabilities, Error, KeyBuffer, Result};

/// Kernel key serial number.
pub type KeySerial = i32;

/// Special serial for the calling process's session keyring.
pub const SESSION_KEYRING: KeySerial = -3;

const NAME_PREFIXES: [&str; 3] = ["ext4", "f2fs", "fscrypt"];
const KEY_TYPE: &str = "logon";

/// Length of a raw key reference (the policy key descriptor).
pub const RAW_REF_LEN: usize = 8;
/// Size of an AES-256-XTS key.
pub const AES_256_XTS_KEY_LEN: usize = 64;
const MAX_KEY_LEN: usize = 64;
const MODE_AES_256_XTS: u32 = 1;

/// Opaque 8-byte handle binding an installed key to an encryption policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawKeyRef([u8; RAW_REF_LEN]);

impl RawKeyRef {
    pub fn new(bytes: [u8; RAW_REF_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; RAW_REF_LEN] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; RAW_REF_LEN] = bytes.try_into().map_err(|_| {
            Error::Format(format!(
                "raw key ref must be {RAW_REF_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for RawKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for RawKeyRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::Format(format!("bad raw key ref: {e}")))?;
        Self::from_slice(&bytes)
    }
}

/// First 8 bytes of `SHA512(SHA512(key))`.
///
/// With hardware-wrapped keys only the first half is stable across boots,
/// so only that half participates.
pub fn raw_key_ref(key: &[u8], wrapped_key_supported: bool) -> RawKeyRef {
    let material = if wrapped_key_supported {
        &key[..key.len() / 2]
    } else {
        key
    };
    let inner = Sha512::digest(material);
    let outer = Sha512::digest(inner);

    let mut out = [0u8; RAW_REF_LEN];
    out.copy_from_slice(&outer[..RAW_REF_LEN]);
    RawKeyRef(out)
}

/// Access to the kernel key registry.
pub trait KernelKeyring {
    /// Finds a key or keyring; a miss is [`Error::NotFound`].
    fn search(&self, keyring: KeySerial, key_type: &str, description: &str) -> Result<KeySerial>;

    /// Adds or updates a key in `keyring`.
    fn add_key(
        &self,
        key_type: &str,
        description: &str,
        payload: &[u8],
        keyring: KeySerial,
    ) -> Result<KeySerial>;

    fn unlink(&self, key: KeySerial, keyring: KeySerial) -> Result<()>;
}

fn key_name(prefix: &str, raw_ref: &RawKeyRef) -> String {
    format!("{prefix}:{raw_ref}")
}

/// Kernel mode number for a contents encryption mode name.
///
/// Only AES-256-XTS keys can be installed.
pub fn contents_mode_id(name: &str) -> Result<u32> {
    match name {
        "aes-256-xts" => Ok(MODE_AES_256_XTS),
        other => Err(Error::Format(format!("unsupported contents mode {other}"))),
    }
}

/// Builds the kernel's fscrypt key payload: `mode | raw[64] | size`.
fn fill_key(key: &[u8], mode: u32) -> Result<KeyBuffer> {
    if key.len() != AES_256_XTS_KEY_LEN {
        error!(len = key.len(), "wrong size key");
        return Err(Error::Format(format!("wrong size key {}", key.len())));
    }
    let mut payload = KeyBuffer::zeroed(4 + MAX_KEY_LEN + 4);
    let buf = payload.as_mut_slice();
    buf[..4].copy_from_slice(&mode.to_ne_bytes());
    buf[4..4 + key.len()].copy_from_slice(key);
    buf[4 + MAX_KEY_LEN..].copy_from_slice(&(key.len() as u32).to_ne_bytes());
    Ok(payload)
}

fn device_keyring(keyring: &dyn KernelKeyring, name: &str) -> Result<KeySerial> {
    keyring
        .search(SESSION_KEYRING, "keyring", name)
        .map_err(|e| Error::Registry(format!("unable to find device keyring {name}: {e}")))
}

/// Installs `key` under every alias and returns its raw reference.
///
/// All or nothing: if one alias is rejected, the ones already added are
/// unlinked again before the error is returned.
pub fn install_key(
    keyring: &dyn KernelKeyring,
    key: &[u8],
    caps: &Capabilities,
) -> Result<RawKeyRef> {
    let payload = fill_key(key, contents_mode_id(&caps.contents_mode)?)?;
    let raw_ref = raw_key_ref(key, caps.wrapped_key_supported);
    let device = device_keyring(keyring, &caps.keyring_name)?;

    let mut added = Vec::with_capacity(NAME_PREFIXES.len());
    for prefix in NAME_PREFIXES {
        let name = key_name(prefix, &raw_ref);
        match keyring.add_key(KEY_TYPE, &name, &payload, device) {
            Ok(id) => {
                debug!(key_id = id, name = %name, keyring = device, "added key");
                added.push(id);
            }
            Err(e) => {
                for id in added {
                    if let Err(unlink) = keyring.unlink(id, device) {
                        error!(key_id = id, error = %unlink, "failed to roll back key");
                    }
                }
                return Err(Error::Registry(format!("failed to insert key {name}: {e}")));
            }
        }
    }
    Ok(raw_ref)
}

/// Unlinks every alias of `raw_ref`. Best-effort.
pub fn evict_key(keyring: &dyn KernelKeyring, raw_ref: &RawKeyRef, keyring_name: &str) -> bool {
    let device = match device_keyring(keyring, keyring_name) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "cannot evict key");
            return false;
        }
    };

    let mut success = true;
    for prefix in NAME_PREFIXES {
        let name = key_name(prefix, raw_ref);
        // unlink rather than revoke
        let unlinked = keyring
            .search(device, KEY_TYPE, &name)
            .and_then(|serial| keyring.unlink(serial, device).map(|_| serial));
        match unlinked {
            Ok(serial) => debug!(serial, name = %name, "unlinked key"),
            Err(e) => {
                error!(name = %name, error = %e, "failed to unlink key");
                success = false;
            }
        }
    }
    success
}

/// Kernel key registry reached through `add_key(2)` and `keyctl(2)`.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxKeyring;

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CString;

    use super::{KernelKeyring, KeySerial, LinuxKeyring};
    use crate::{Error, Result};

    const KEYCTL_UNLINK: libc::c_long = 9;
    const KEYCTL_SEARCH: libc::c_long = 10;

    fn cstring(s: &str) -> Result<CString> {
        CString::new(s).map_err(|_| Error::Format(format!("{s:?} contains a NUL byte")))
    }

    fn check(ret: libc::c_long, what: &str) -> Result<KeySerial> {
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOKEY) => Error::NotFound(format!("{what}: {err}")),
                _ => Error::Registry(format!("{what}: {err}")),
            });
        }
        KeySerial::try_from(ret).map_err(|_| Error::Registry(format!("{what}: bad serial {ret}")))
    }

    impl KernelKeyring for LinuxKeyring {
        fn search(
            &self,
            keyring: KeySerial,
            key_type: &str,
            description: &str,
        ) -> Result<KeySerial> {
            let key_type = cstring(key_type)?;
            let description = cstring(description)?;
            // SAFETY: both strings are NUL-terminated and outlive the call;
            // a destination keyring of 0 means "do not link".
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_keyctl,
                    KEYCTL_SEARCH,
                    keyring as libc::c_long,
                    key_type.as_ptr(),
                    description.as_ptr(),
                    0 as libc::c_long,
                )
            };
            check(ret, "keyctl_search")
        }

        fn add_key(
            &self,
            key_type: &str,
            description: &str,
            payload: &[u8],
            keyring: KeySerial,
        ) -> Result<KeySerial> {
            let key_type = cstring(key_type)?;
            let description = cstring(description)?;
            // SAFETY: pointers are valid for the given lengths for the
            // duration of the call; the kernel copies the payload.
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_add_key,
                    key_type.as_ptr(),
                    description.as_ptr(),
                    payload.as_ptr(),
                    payload.len(),
                    keyring as libc::c_long,
                )
            };
            check(ret, "add_key")
        }

        fn unlink(&self, key: KeySerial, keyring: KeySerial) -> Result<()> {
            // SAFETY: plain integer arguments.
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_keyctl,
                    KEYCTL_UNLINK,
                    key as libc::c_long,
                    keyring as libc::c_long,
                )
            };
            check(ret, "keyctl_unlink").map(|_| ())
        }
    }
}
