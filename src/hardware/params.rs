use std::fmt;

use zeroize::Zeroizing;

/// Authenticator kinds a key can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticatorType {
    Password,
    Fingerprint,
}

#[derive(Clone, PartialEq, Eq)]
pub enum KeyParam {
    AlgorithmAes,
    KeySize(u32),
    BlockModeGcm,
    PaddingNone,
    /// Minimum tag length in bits accepted by the key.
    MinMacLength(u32),
    /// Tag length in bits for one operation.
    MacLength(u32),
    /// Derived from the credential; wiped on drop.
    ApplicationId(Zeroizing<Vec<u8>>),
    Nonce(Vec<u8>),
    NoAuthRequired,
    UserSecureId(u64),
    UserAuthType(AuthenticatorType),
    AuthTimeout(u32),
    UserId(u32),
    /// Key is a hardware-wrapped inline-encryption key.
    FbeIce,
    /// 0 for device-bound keys, 1 for credential-bound keys.
    FbeKeyType(u32),
}

impl fmt::Debug for KeyParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyParam::ApplicationId(id) => write!(f, "ApplicationId([REDACTED; {}])", id.len()),
            KeyParam::AlgorithmAes => f.write_str("AlgorithmAes"),
            KeyParam::KeySize(v) => write!(f, "KeySize({v})"),
            KeyParam::BlockModeGcm => f.write_str("BlockModeGcm"),
            KeyParam::PaddingNone => f.write_str("PaddingNone"),
            KeyParam::MinMacLength(v) => write!(f, "MinMacLength({v})"),
            KeyParam::MacLength(v) => write!(f, "MacLength({v})"),
            KeyParam::Nonce(n) => write!(f, "Nonce({})", hex::encode(n)),
            KeyParam::NoAuthRequired => f.write_str("NoAuthRequired"),
            KeyParam::UserSecureId(v) => write!(f, "UserSecureId({v})"),
            KeyParam::UserAuthType(t) => write!(f, "UserAuthType({t:?})"),
            KeyParam::AuthTimeout(v) => write!(f, "AuthTimeout({v})"),
            KeyParam::UserId(v) => write!(f, "UserId({v})"),
            KeyParam::FbeIce => f.write_str("FbeIce"),
            KeyParam::FbeKeyType(v) => write!(f, "FbeKeyType({v})"),
        }
    }
}

/// Ordered list of key parameters passed to and returned from the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationSet {
    params: Vec<KeyParam>,
}

impl AuthorizationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, param: KeyParam) -> Self {
        self.params.push(param);
        self
    }

    pub fn push(&mut self, param: KeyParam) {
        self.params.push(param);
    }

    /// AES key of `bits` bits.
    pub fn aes_encryption_key(bits: u32) -> Self {
        Self::new()
            .with(KeyParam::AlgorithmAes)
            .with(KeyParam::KeySize(bits))
    }

    /// GCM without padding, accepting tags of at least `min_mac_bits`.
    pub fn gcm_mode_min_mac(self, min_mac_bits: u32) -> Self {
        self.with(KeyParam::BlockModeGcm)
            .with(KeyParam::PaddingNone)
            .with(KeyParam::MinMacLength(min_mac_bits))
    }

    /// Per-operation GCM parameters.
    pub fn gcm_operation(mac_bits: u32) -> Self {
        Self::new()
            .with(KeyParam::BlockModeGcm)
            .with(KeyParam::PaddingNone)
            .with(KeyParam::MacLength(mac_bits))
    }

    pub fn extend(&mut self, other: &AuthorizationSet) {
        self.params.extend(other.params.iter().cloned());
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyParam> {
        self.params.iter()
    }

    pub fn contains(&self, param: &KeyParam) -> bool {
        self.params.contains(param)
    }

    pub fn nonce(&self) -> Option<&[u8]> {
        self.params.iter().find_map(|p| match p {
            KeyParam::Nonce(n) => Some(n.as_slice()),
            _ => None,
        })
    }

    pub fn application_id(&self) -> Option<&[u8]> {
        self.params.iter().find_map(|p| match p {
            KeyParam::ApplicationId(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    pub fn mac_length(&self) -> Option<u32> {
        self.params.iter().find_map(|p| match p {
            KeyParam::MacLength(v) => Some(*v),
            _ => None,
        })
    }
}
