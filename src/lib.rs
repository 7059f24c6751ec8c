//! Recovery of file-based-encryption storage keys.
//!
//! Keys are kept on the data partition in envelope directories sealed by
//! a hardware key backend and, for credential-bound keys, by a secret
//! derived from the user's credential. This crate reads those envelopes,
//! runs the credential through the platform's verification chain and
//! installs the recovered keys in the kernel keyring.
//!
//! Hardware access goes through the traits in [`hardware`]; the kernel
//! keyring through [`keyring::KernelKeyring`].

pub mod config;
pub mod crypto;
pub mod decrypt;
mod error;
pub mod format;
pub mod fscrypt;
pub mod hardware;
mod key_buffer;
pub mod key_storage;
pub mod keyring;
pub mod layout;
pub mod platform;
pub mod registry;
pub mod storage;
pub mod synthetic;
pub mod weaver;

pub use crate::config::{Capabilities, Config};
pub use crate::decrypt::{DecryptError, DecryptStep, Decryptor, PasswordType};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::fscrypt::KeyManager;
pub use crate::key_buffer::KeyBuffer;
pub use crate::key_storage::KeyAuthentication;
pub use crate::keyring::RawKeyRef;
pub use crate::layout::DataLayout;
pub use crate::registry::{KeyKind, KeyRefRegistry, PolicyType};
