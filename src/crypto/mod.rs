//! Cryptographic primitives for key recovery.
//!
//! Provides domain-separated hashing, credential stretching and the
//! software AES-256-GCM path.

pub mod aead;
pub mod hash;
pub mod kdf;

pub use aead::{decrypt, decrypt_parts, encrypt, secure_random};
pub use hash::{personalized_hash, sp800_derive};
pub use kdf::{ScryptParams, Stretching, stretch, stretching_needs_salt};

/// Length of the AES-GCM nonce (12 bytes).
pub const GCM_NONCE_LEN: usize = 12;
/// Length of the AES-GCM tag (16 bytes / 128 bits).
pub const GCM_MAC_LEN: usize = 16;
/// Length of an AES-256 key (32 bytes).
pub const AES_KEY_LEN: usize = 32;
/// Length of a SHA-512 digest (64 bytes).
pub const SHA512_LEN: usize = 64;
/// Output length of the scrypt stretch (64 bytes).
pub const STRETCHED_LEN: usize = 64;
/// Length of the stretching salt (16 bytes).
pub const SALT_LEN: usize = 16;

/// Hash prefixes. Each is zero-padded to one SHA-512 block before the data.
pub mod prefix {
    pub const SECDISCARDABLE: &str = "Android secdiscardable SHA512";
    pub const KEY_WRAPPING: &str = "Android key wrapping key generation SHA512";
    pub const FBE_CREDENTIAL: &str = "Android FBE credential hash";
    pub const WEAVER_KEY: &str = "weaver-key";
    pub const WEAVER_PASSWORD: &str = "weaver-pwd";
    pub const APPLICATION_ID: &str = "application-id";
    pub const FBE_KEY: &str = "fbe-key";
    pub const USER_GK_AUTH: &str = "user-gk-authentication";
    pub const SECDISCARDABLE_TRANSFORM: &str = "secdiscardable-transform";
    pub const PERSONALIZATION_CONTEXT: &str = "android-synthetic-password-personalization-context";
}
