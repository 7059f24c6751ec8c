//! In-memory record of which keys are installed.
//!
//! Backup tools name an encryption policy by a short type string instead
//! of its raw reference: `1DK` for the device key, `1DE<user>` and
//! `1CE<user>` for per-user keys.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::keyring::RawKeyRef;
use crate::{Error, Result};

const POLICY_VERSION: char = '1';

/// Which protection class a per-user key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Device-encrypted: available after boot.
    De,
    /// Credential-encrypted: available after the user authenticates.
    Ce,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::De => f.write_str("DE"),
            KeyKind::Ce => f.write_str("CE"),
        }
    }
}

/// Textual policy name of an installed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyType {
    Device,
    User { kind: KeyKind, user_id: u32 },
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyType::Device => write!(f, "{POLICY_VERSION}DK"),
            PolicyType::User { kind, user_id } => write!(f, "{POLICY_VERSION}{kind}{user_id}"),
        }
    }
}

impl FromStr for PolicyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(POLICY_VERSION)
            .ok_or_else(|| Error::Format(format!("unexpected policy version in {s:?}")))?;
        if rest == "DK" {
            return Ok(PolicyType::Device);
        }

        let (kind, id) = if let Some(id) = rest.strip_prefix("DE") {
            (KeyKind::De, id)
        } else if let Some(id) = rest.strip_prefix("CE") {
            (KeyKind::Ce, id)
        } else {
            return Err(Error::Format(format!("unknown policy type {s:?}")));
        };
        let user_id = id
            .parse()
            .map_err(|_| Error::Format(format!("bad user id in policy type {s:?}")))?;
        Ok(PolicyType::User { kind, user_id })
    }
}

/// Raw references of every key installed in this session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRefRegistry {
    device: Option<RawKeyRef>,
    de: BTreeMap<u32, RawKeyRef>,
    ce: BTreeMap<u32, RawKeyRef>,
}

impl KeyRefRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: KeyKind) -> &BTreeMap<u32, RawKeyRef> {
        match kind {
            KeyKind::De => &self.de,
            KeyKind::Ce => &self.ce,
        }
    }

    fn map_mut(&mut self, kind: KeyKind) -> &mut BTreeMap<u32, RawKeyRef> {
        match kind {
            KeyKind::De => &mut self.de,
            KeyKind::Ce => &mut self.ce,
        }
    }

    pub fn device(&self) -> Option<RawKeyRef> {
        self.device
    }

    /// Records the device key reference. Returns `false` if one is already
    /// recorded.
    pub fn set_device(&mut self, raw_ref: RawKeyRef) -> bool {
        if self.device.is_some() {
            return false;
        }
        self.device = Some(raw_ref);
        true
    }

    pub fn contains(&self, kind: KeyKind, user_id: u32) -> bool {
        self.map(kind).contains_key(&user_id)
    }

    pub fn lookup(&self, kind: KeyKind, user_id: u32) -> Result<RawKeyRef> {
        self.map(kind)
            .get(&user_id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("no {kind} key installed for user {user_id}")))
    }

    /// Records a reference. An existing entry is never replaced; returns
    /// whether the insert took place.
    pub fn insert(&mut self, kind: KeyKind, user_id: u32, raw_ref: RawKeyRef) -> bool {
        let map = self.map_mut(kind);
        if map.contains_key(&user_id) {
            return false;
        }
        map.insert(user_id, raw_ref);
        true
    }

    pub fn remove(&mut self, kind: KeyKind, user_id: u32) -> Option<RawKeyRef> {
        self.map_mut(kind).remove(&user_id)
    }

    /// Names the policy an installed reference belongs to.
    pub fn policy_type_for(&self, raw_ref: &RawKeyRef) -> Option<PolicyType> {
        if self.device.as_ref() == Some(raw_ref) {
            return Some(PolicyType::Device);
        }
        [KeyKind::De, KeyKind::Ce].into_iter().find_map(|kind| {
            self.map(kind)
                .iter()
                .find(|(_, r)| *r == raw_ref)
                .map(|(user_id, _)| PolicyType::User {
                    kind,
                    user_id: *user_id,
                })
        })
    }

    /// Resolves a textual policy type back to its raw reference.
    pub fn raw_ref_for(&self, policy_type: &str) -> Result<RawKeyRef> {
        match policy_type.parse()? {
            PolicyType::Device => self
                .device
                .ok_or_else(|| Error::NotFound("device key not installed".into())),
            PolicyType::User { kind, user_id } => self.lookup(kind, user_id),
        }
    }
}
