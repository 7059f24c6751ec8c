//! In-process doubles for the hardware collaborators.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::rc::Rc;

use aes_gcm::aead::{Aead, AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

use fbe_unlock::crypto::{self, ScryptParams, prefix};
use fbe_unlock::format::{PasswordData, PasswordKind, SpBlob, SpBlobVersion, WeaverData};
use fbe_unlock::hardware::{
    AuthorizationSet, Gatekeeper, GatekeeperResponse, KeyBackend, KeyParam, KeyPurpose,
    KeySource, OperationHandle, WeaverConfig, WeaverDevice, WeaverReadResponse, WeaverStatus,
    auth_token_user_id, AUTH_TOKEN_LEN,
};
use fbe_unlock::key_storage::{self, KeyAuthentication};
use fbe_unlock::keyring::{KernelKeyring, KeySerial, SESSION_KEYRING};
use fbe_unlock::platform::{OverwriteDiscard, StoragePreparer};
use fbe_unlock::{
    Capabilities, DataLayout, Decryptor, Error, KeyBuffer, KeyManager, Result,
};

pub const HANDLE: &str = "0c5303fd2010fe29";
pub const ALIAS: &str = "USRSKEY_synthetic_password_c5303fd2010fe29";

pub fn caps() -> Capabilities {
    Capabilities {
        scrypt_params: ScryptParams::new(4, 0, 0),
        ..Capabilities::default()
    }
}

pub fn random(len: usize) -> Vec<u8> {
    KeyBuffer::random(len).unwrap().to_vec()
}

/// Hardware auth token carrying `secure_id`.
pub fn auth_token(secure_id: u64) -> Vec<u8> {
    let mut token = vec![0u8; AUTH_TOKEN_LEN];
    token[9..17].copy_from_slice(&secure_id.to_le_bytes());
    token
}

// ---------------------------------------------------------------------------
// Key backend
// ---------------------------------------------------------------------------

struct StoredKey {
    key: [u8; 32],
    app_id: Option<Vec<u8>>,
    secure_id: Option<u64>,
}

struct Op {
    purpose: KeyPurpose,
    key: [u8; 32],
    nonce: Vec<u8>,
    input: Vec<u8>,
    tag: Vec<u8>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    blobs: HashMap<Vec<u8>, StoredKey>,
    aliases: HashMap<String, StoredKey>,
    ops: HashMap<u64, Op>,
    upgraded: HashSet<Vec<u8>>,
    deleted: Vec<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    state: RefCell<State>,
    begins: Cell<u32>,
    upgrades: Cell<u32>,
    needs_upgrade: Cell<bool>,
    wrapped: Cell<u32>,
}

/// Software AES-256-GCM key backend enforcing application-id binding and
/// auth tokens the way the hardware does.
#[derive(Clone, Default)]
pub struct SoftKeymaster(Rc<Inner>);

impl SoftKeymaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begins(&self) -> u32 {
        self.0.begins.get()
    }

    pub fn upgrades(&self) -> u32 {
        self.0.upgrades.get()
    }

    pub fn wrapped_keys_generated(&self) -> u32 {
        self.0.wrapped.get()
    }

    pub fn deleted(&self) -> usize {
        self.0.state.borrow().deleted.len()
    }

    /// Every blob must be upgraded before use.
    pub fn require_upgrade(&self) {
        self.0.needs_upgrade.set(true);
    }

    /// Registers a key store alias; a key with `secure_id` requires a
    /// matching auth token on begin.
    pub fn add_alias(&self, alias: &str, key: [u8; 32], secure_id: Option<u64>) {
        self.0.state.borrow_mut().aliases.insert(
            alias.to_owned(),
            StoredKey {
                key,
                app_id: None,
                secure_id,
            },
        );
    }

    fn new_blob(state: &mut State) -> Vec<u8> {
        state.next_id += 1;
        format!("blob-{}", state.next_id).into_bytes()
    }

    fn check_auth(stored: &StoredKey, auth_token: &[u8]) -> Result<()> {
        if let Some(sid) = stored.secure_id {
            let presented = auth_token_user_id(auth_token)
                .map_err(|_| Error::Hardware("KEY_USER_NOT_AUTHENTICATED".into()))?;
            if presented != sid {
                return Err(Error::Hardware("KEY_USER_NOT_AUTHENTICATED".into()));
            }
        }
        Ok(())
    }
}

impl KeyBackend for SoftKeymaster {
    fn version(&self) -> u32 {
        4
    }

    fn generate_key(&self, params: &AuthorizationSet) -> Result<Vec<u8>> {
        let mut state = self.0.state.borrow_mut();
        let blob = Self::new_blob(&mut state);
        let secure_id = params.iter().find_map(|p| match p {
            KeyParam::UserSecureId(sid) => Some(*sid),
            _ => None,
        });
        let mut key = [0u8; 32];
        key.copy_from_slice(&random(32));
        state.blobs.insert(
            blob.clone(),
            StoredKey {
                key,
                app_id: params.application_id().map(<[u8]>::to_vec),
                secure_id,
            },
        );
        Ok(blob)
    }

    fn begin(
        &self,
        purpose: KeyPurpose,
        source: KeySource<'_>,
        params: &AuthorizationSet,
        auth_token: &[u8],
    ) -> Result<(OperationHandle, AuthorizationSet)> {
        self.0.begins.set(self.0.begins.get() + 1);
        let mut state = self.0.state.borrow_mut();

        let key = match source {
            KeySource::Blob(blob) => {
                if self.0.needs_upgrade.get() && !state.upgraded.contains(blob) {
                    return Err(Error::KeyRequiresUpgrade);
                }
                let stored = state
                    .blobs
                    .get(blob)
                    .ok_or_else(|| Error::Hardware("INVALID_KEY_BLOB".into()))?;
                if stored.app_id.as_deref() != params.application_id() {
                    return Err(Error::Hardware("INVALID_KEY_BLOB".into()));
                }
                Self::check_auth(stored, auth_token)?;
                stored.key
            }
            KeySource::Alias(alias) => {
                let stored = state
                    .aliases
                    .get(alias)
                    .ok_or_else(|| Error::Hardware(format!("KEY_NOT_FOUND {alias}")))?;
                Self::check_auth(stored, auth_token)?;
                stored.key
            }
        };

        let mut out = AuthorizationSet::new();
        let nonce = match purpose {
            KeyPurpose::Encrypt => {
                let nonce = random(12);
                out.push(KeyParam::Nonce(nonce.clone()));
                nonce
            }
            KeyPurpose::Decrypt => params
                .nonce()
                .ok_or_else(|| Error::Hardware("MISSING_NONCE".into()))?
                .to_vec(),
        };

        state.next_id += 1;
        let id = state.next_id;
        state.ops.insert(
            id,
            Op {
                purpose,
                key,
                nonce,
                input: Vec::new(),
                tag: Vec::new(),
            },
        );
        Ok((OperationHandle(id), out))
    }

    fn update(&self, op: OperationHandle, input: &[u8]) -> Result<(usize, KeyBuffer)> {
        let mut state = self.0.state.borrow_mut();
        let op = state
            .ops
            .get_mut(&op.0)
            .ok_or_else(|| Error::Hardware("INVALID_OPERATION_HANDLE".into()))?;
        match op.purpose {
            KeyPurpose::Encrypt => {
                let cipher = Aes256Gcm::new_from_slice(&op.key).unwrap();
                let mut buf = input.to_vec();
                let tag = cipher
                    .encrypt_in_place_detached(Nonce::from_slice(&op.nonce), b"", &mut buf)
                    .map_err(|_| Error::Hardware("encrypt".into()))?;
                op.tag = tag.to_vec();
                Ok((input.len(), KeyBuffer::new(buf)))
            }
            KeyPurpose::Decrypt => {
                op.input.extend_from_slice(input);
                Ok((input.len(), KeyBuffer::default()))
            }
        }
    }

    fn finish(&self, op: OperationHandle) -> Result<KeyBuffer> {
        let op = self
            .0
            .state
            .borrow_mut()
            .ops
            .remove(&op.0)
            .ok_or_else(|| Error::Hardware("INVALID_OPERATION_HANDLE".into()))?;
        match op.purpose {
            KeyPurpose::Encrypt => Ok(KeyBuffer::new(op.tag)),
            KeyPurpose::Decrypt => {
                let cipher = Aes256Gcm::new_from_slice(&op.key).unwrap();
                cipher
                    .decrypt(Nonce::from_slice(&op.nonce), op.input.as_slice())
                    .map(KeyBuffer::new)
                    .map_err(|_| Error::Hardware("VERIFICATION_FAILED".into()))
            }
        }
    }

    fn abort(&self, op: OperationHandle) -> Result<()> {
        self.0.state.borrow_mut().ops.remove(&op.0);
        Ok(())
    }

    fn delete_key(&self, blob: &[u8]) -> Result<()> {
        let mut state = self.0.state.borrow_mut();
        state.blobs.remove(blob);
        state.deleted.push(blob.to_vec());
        Ok(())
    }

    fn upgrade_key(&self, blob: &[u8], _: &AuthorizationSet) -> Result<Vec<u8>> {
        self.0.upgrades.set(self.0.upgrades.get() + 1);
        let mut state = self.0.state.borrow_mut();
        let old = state
            .blobs
            .get(blob)
            .ok_or_else(|| Error::Hardware("INVALID_KEY_BLOB".into()))?;
        let copy = StoredKey {
            key: old.key,
            app_id: old.app_id.clone(),
            secure_id: old.secure_id,
        };
        let new_blob = Self::new_blob(&mut state);
        state.blobs.insert(new_blob.clone(), copy);
        state.upgraded.insert(new_blob.clone());
        Ok(new_blob)
    }

    fn generate_wrapped_key(&self, _: &AuthorizationSet) -> Result<KeyBuffer> {
        self.0.wrapped.set(self.0.wrapped.get() + 1);
        Ok(KeyBuffer::new(random(64)))
    }

    fn export_ephemeral_key(&self, wrapped: &[u8]) -> Result<KeyBuffer> {
        // stable first half, per-boot second half
        let mut out = wrapped.to_vec();
        for b in &mut out[wrapped.len() / 2..] {
            *b ^= 0x5a;
        }
        Ok(KeyBuffer::new(out))
    }
}

// ---------------------------------------------------------------------------
// Weaver and gatekeeper
// ---------------------------------------------------------------------------

#[derive(Default)]
struct WeaverInner {
    slots: RefCell<BTreeMap<u32, (Vec<u8>, Vec<u8>)>>,
    throttle_secs: Cell<u32>,
    reads: Cell<u32>,
}

#[derive(Clone, Default)]
pub struct FakeWeaver(Rc<WeaverInner>);

impl FakeWeaver {
    pub const KEY_SIZE: usize = 16;

    pub fn enroll(&self, slot: u32, key: &[u8], payload: &[u8]) {
        let mut sized = key.to_vec();
        sized.resize(Self::KEY_SIZE, 0);
        self.0
            .slots
            .borrow_mut()
            .insert(slot, (sized, payload.to_vec()));
    }

    pub fn throttle(&self, seconds: u32) {
        self.0.throttle_secs.set(seconds);
    }

    pub fn reads(&self) -> u32 {
        self.0.reads.get()
    }
}

impl WeaverDevice for FakeWeaver {
    fn config(&self) -> Result<WeaverConfig> {
        Ok(WeaverConfig {
            slots: 8,
            key_size: Self::KEY_SIZE as u32,
            value_size: 16,
        })
    }

    fn read(&self, slot: u32, key: &[u8]) -> Result<WeaverReadResponse> {
        self.0.reads.set(self.0.reads.get() + 1);
        let throttle = self.0.throttle_secs.get();
        if throttle > 0 {
            return Ok(WeaverReadResponse {
                status: WeaverStatus::Throttle,
                payload: KeyBuffer::default(),
                timeout_secs: throttle,
            });
        }
        let slots = self.0.slots.borrow();
        match slots.get(&slot) {
            Some((stored, payload)) if stored.as_slice() == key => Ok(WeaverReadResponse {
                status: WeaverStatus::Ok,
                payload: KeyBuffer::from_slice(payload),
                timeout_secs: 0,
            }),
            _ => Ok(WeaverReadResponse {
                status: WeaverStatus::IncorrectKey,
                payload: KeyBuffer::default(),
                timeout_secs: 0,
            }),
        }
    }
}

struct Enrolment {
    uid: u32,
    handle: Vec<u8>,
    credential: Vec<u8>,
    auth_token: Vec<u8>,
}

#[derive(Default)]
struct GatekeeperInner {
    enrolments: RefCell<Vec<Enrolment>>,
    verifies: Cell<u32>,
}

#[derive(Clone, Default)]
pub struct FakeGatekeeper(Rc<GatekeeperInner>);

impl FakeGatekeeper {
    pub fn enroll(&self, uid: u32, handle: &[u8], credential: &[u8], auth_token: &[u8]) {
        self.0.enrolments.borrow_mut().push(Enrolment {
            uid,
            handle: handle.to_vec(),
            credential: credential.to_vec(),
            auth_token: auth_token.to_vec(),
        });
    }

    pub fn verifies(&self) -> u32 {
        self.0.verifies.get()
    }
}

impl Gatekeeper for FakeGatekeeper {
    fn verify(&self, uid: u32, handle: &[u8], credential: &[u8]) -> Result<GatekeeperResponse> {
        self.0.verifies.set(self.0.verifies.get() + 1);
        self.0
            .enrolments
            .borrow()
            .iter()
            .find(|e| e.uid == uid && e.handle == handle && e.credential == credential)
            .map(|e| GatekeeperResponse {
                auth_token: e.auth_token.clone(),
                should_reenroll: false,
            })
            .ok_or_else(|| Error::Hardware("gatekeeper verification failed".into()))
    }
}

// ---------------------------------------------------------------------------
// Kernel keyring and storage preparation
// ---------------------------------------------------------------------------

pub const DEVICE_KEYRING: KeySerial = 100;

#[derive(Default)]
struct KeyringInner {
    keys: RefCell<BTreeMap<String, (KeySerial, Vec<u8>)>>,
    next: Cell<KeySerial>,
}

#[derive(Clone, Default)]
pub struct MemoryKeyring(Rc<KeyringInner>);

impl MemoryKeyring {
    pub fn names(&self) -> Vec<String> {
        self.0.keys.borrow().keys().cloned().collect()
    }

    pub fn payload(&self, name: &str) -> Option<Vec<u8>> {
        self.0.keys.borrow().get(name).map(|(_, p)| p.clone())
    }
}

impl KernelKeyring for MemoryKeyring {
    fn search(&self, keyring: KeySerial, key_type: &str, description: &str) -> Result<KeySerial> {
        if keyring == SESSION_KEYRING && key_type == "keyring" && description == "e4crypt" {
            return Ok(DEVICE_KEYRING);
        }
        self.0
            .keys
            .borrow()
            .get(description)
            .map(|(serial, _)| *serial)
            .ok_or_else(|| Error::NotFound(description.to_owned()))
    }

    fn add_key(&self, _: &str, description: &str, payload: &[u8], _: KeySerial) -> Result<KeySerial> {
        let serial = 200 + self.0.next.get();
        self.0.next.set(self.0.next.get() + 1);
        self.0
            .keys
            .borrow_mut()
            .insert(description.to_owned(), (serial, payload.to_vec()));
        Ok(serial)
    }

    fn unlink(&self, key: KeySerial, _: KeySerial) -> Result<()> {
        self.0.keys.borrow_mut().retain(|_, (s, _)| *s != key);
        Ok(())
    }
}

#[derive(Default)]
struct PreparerInner {
    calls: RefCell<Vec<(u32, bool)>>,
    fail: Cell<bool>,
}

#[derive(Clone, Default)]
pub struct RecordingPreparer(Rc<PreparerInner>);

impl RecordingPreparer {
    pub fn calls(&self) -> Vec<(u32, bool)> {
        self.0.calls.borrow().clone()
    }

    /// Makes every later call fail.
    pub fn fail(&self, fail: bool) {
        self.0.fail.set(fail);
    }
}

impl StoragePreparer for RecordingPreparer {
    fn prepare_user_storage(&self, user_id: u32, de_area: bool) -> Result<()> {
        self.0.calls.borrow_mut().push((user_id, de_area));
        if self.0.fail.get() {
            return Err(Error::NotFound(format!("storage for user {user_id}")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// One device with its doubles, sharing state with the decryptor under
/// test.
pub struct Device {
    pub layout: DataLayout,
    pub backend: SoftKeymaster,
    pub keyring: MemoryKeyring,
    pub weaver: FakeWeaver,
    pub gatekeeper: FakeGatekeeper,
    pub preparer: RecordingPreparer,
}

impl Device {
    pub fn new(root: &Path) -> Self {
        Self {
            layout: DataLayout::new(root),
            backend: SoftKeymaster::new(),
            keyring: MemoryKeyring::default(),
            weaver: FakeWeaver::default(),
            gatekeeper: FakeGatekeeper::default(),
            preparer: RecordingPreparer::default(),
        }
    }

    pub fn key_manager(&self, caps: Capabilities) -> KeyManager {
        KeyManager::new(
            self.layout.clone(),
            caps,
            Box::new(self.backend.clone()),
            Box::new(self.keyring.clone()),
            Box::new(OverwriteDiscard),
        )
    }

    pub fn decryptor(&self) -> Decryptor {
        Decryptor::new(
            self.key_manager(caps()),
            Box::new(self.weaver.clone()),
            Box::new(self.gatekeeper.clone()),
            Box::new(self.preparer.clone()),
        )
    }

    /// Stores a fresh CE key for `user_id` as `current` and returns it.
    pub fn store_ce_key(&self, user_id: u32, auth: &KeyAuthentication) -> KeyBuffer {
        let dir = self.layout.ce_key_dir(user_id);
        std::fs::create_dir_all(&dir).unwrap();
        let key = KeyBuffer::random(64).unwrap();
        key_storage::store_key(
            &self.layout.current_ce_key(user_id),
            auth,
            &key,
            &self.backend,
            &caps(),
        )
        .unwrap();
        key
    }

    /// Stores a fresh DE key for `user_id` and returns it.
    pub fn store_de_key(&self, user_id: u32) -> KeyBuffer {
        std::fs::create_dir_all(self.layout.de_keys()).unwrap();
        let key = KeyBuffer::random(64).unwrap();
        key_storage::store_key(
            &self.layout.de_key(user_id),
            &KeyAuthentication::empty(),
            &key,
            &self.backend,
            &caps(),
        )
        .unwrap();
        key
    }
}

/// How the synthetic password of a fixture is protected.
pub enum Factor {
    Weaver { slot: u32 },
    Secdiscardable { secure_id: u64 },
}

/// Writes a synthetic-password enrolment for `credential` and a CE key
/// sealed with the resulting secret. Returns the CE key.
pub fn enroll_synthetic(
    device: &Device,
    user_id: u32,
    credential: &[u8],
    version: SpBlobVersion,
    factor: Factor,
) -> KeyBuffer {
    let spblob_dir = device.layout.spblob_dir(user_id);
    std::fs::create_dir_all(&spblob_dir).unwrap();

    let gk_handle = b"sp-gatekeeper-handle".to_vec();
    let pwd = PasswordData::new(
        PasswordKind::PinOrPassword,
        ScryptParams::new(4, 0, 0),
        random(16),
        gk_handle.clone(),
    );
    std::fs::write(spblob_dir.join(format!("{HANDLE}.pwd")), pwd.to_bytes()).unwrap();
    let token = pwd.password_token(credential).unwrap();

    let (application_id, secure_id) = match factor {
        Factor::Weaver { slot } => {
            let weaver_key = crypto::personalized_hash(prefix::WEAVER_KEY, &token);
            let payload = random(16);
            device.weaver.enroll(slot, &weaver_key, &payload);
            std::fs::write(
                spblob_dir.join(format!("{HANDLE}.weaver")),
                WeaverData::new(1, slot).to_bytes(),
            )
            .unwrap();
            let secret = crypto::personalized_hash(prefix::WEAVER_PASSWORD, &payload);
            (KeyBuffer::concat(&token, &secret), None)
        }
        Factor::Secdiscardable { secure_id } => {
            let secdis = random(1024);
            std::fs::write(spblob_dir.join(format!("{HANDLE}.secdis")), &secdis).unwrap();
            let gk_credential = crypto::personalized_hash(prefix::USER_GK_AUTH, &token);
            device.gatekeeper.enroll(
                100_000 + user_id,
                &gk_handle,
                &gk_credential,
                &auth_token(secure_id),
            );
            let transformed = crypto::personalized_hash(prefix::SECDISCARDABLE_TRANSFORM, &secdis);
            (KeyBuffer::concat(&token, &transformed), Some(secure_id))
        }
    };

    let mut alias_key = [0u8; 32];
    alias_key.copy_from_slice(&random(32));
    device.backend.add_alias(ALIAS, alias_key, secure_id);
    let keystore_dir = device.layout.keystore_user_dir(user_id);
    std::fs::create_dir_all(&keystore_dir).unwrap();
    std::fs::write(keystore_dir.join(format!("1000_{ALIAS}")), b"keyblob").unwrap();

    let synthetic_password = random(32);
    let software_key = crypto::personalized_hash(prefix::APPLICATION_ID, &application_id);
    let software_key = &software_key[..32];
    let sealed = match version {
        SpBlobVersion::V1 => {
            let inner = crypto::encrypt(&alias_key, &synthetic_password).unwrap();
            crypto::encrypt(software_key, &inner).unwrap()
        }
        SpBlobVersion::V2 | SpBlobVersion::V3 => {
            let inner = crypto::encrypt(software_key, &synthetic_password).unwrap();
            crypto::encrypt(&alias_key, &inner).unwrap()
        }
    };
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&sealed[..12]);
    let blob = SpBlob::new(version, nonce, sealed[12..].to_vec());
    std::fs::write(spblob_dir.join(format!("{HANDLE}.spblob")), blob.to_bytes()).unwrap();

    let secret = match version {
        SpBlobVersion::V3 => crypto::sp800_derive(
            &synthetic_password,
            prefix::FBE_KEY.as_bytes(),
            prefix::PERSONALIZATION_CONTEXT.as_bytes(),
        )
        .unwrap(),
        _ => crypto::personalized_hash(prefix::FBE_KEY, &synthetic_password),
    };
    device.store_ce_key(user_id, &KeyAuthentication::new(b"", &secret))
}
