use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use secp256k1::{PublicKey, SecretKey};
use tracing::{debug, info};

use crate::derivation::{DerivationError, ExtendedKey};
use crate::keypath::{KeyPath, KeyPathError, HARDENED_BIT};
use crate::records::{ChainID, HDChain, HDPubKey, KeyID, RECORD_VERSION};
use crate::vault::{MasterSeed, SeedCipher, SeedVault, VaultError};

#[derive(Debug)]
pub enum KeyStoreError {
    InvalidKeyPath(KeyPathError),
    UnknownChain,
    UnknownKey,
    IndexExhausted,
    Locked,
    NotCrypted,
    DerivationFailed(DerivationError),
    SeedEncodingInvalid,
}

impl fmt::Display for KeyStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStoreError::InvalidKeyPath(e) => write!(f, "invalid keypath: {}", e),
            KeyStoreError::UnknownChain => write!(f, "unknown chain id"),
            KeyStoreError::UnknownKey => write!(f, "key not present in the store"),
            KeyStoreError::IndexExhausted => write!(f, "no more available child indices"),
            KeyStoreError::Locked => write!(f, "master seed unavailable while locked"),
            KeyStoreError::NotCrypted => write!(f, "store holds no encrypted seeds"),
            KeyStoreError::DerivationFailed(e) => write!(f, "derivation failed: {}", e),
            KeyStoreError::SeedEncodingInvalid => {
                write!(f, "stored seed did not decode as an extended private key")
            }
        }
    }
}

impl std::error::Error for KeyStoreError {}

impl From<KeyPathError> for KeyStoreError {
    fn from(err: KeyPathError) -> Self {
        KeyStoreError::InvalidKeyPath(err)
    }
}

impl From<VaultError> for KeyStoreError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::UnknownChain => KeyStoreError::UnknownChain,
            VaultError::Locked => KeyStoreError::Locked,
            VaultError::NotCrypted => KeyStoreError::NotCrypted,
        }
    }
}

impl From<DerivationError> for KeyStoreError {
    fn from(err: DerivationError) -> Self {
        match err {
            // only raised here when a 74-byte seed fails to decode
            DerivationError::InvalidEncoding => KeyStoreError::SeedEncodingInvalid,
            other => KeyStoreError::DerivationFailed(other),
        }
    }
}

/// Lookups against the non-HD keys a wallet may also hold. The store
/// falls through to this on every catalog miss.
pub trait BaseKeyStore {
    fn have_key(&self, key_id: &KeyID) -> bool;
    fn get_key(&self, key_id: &KeyID) -> Option<SecretKey>;
    fn get_pub_key(&self, key_id: &KeyID) -> Option<PublicKey>;
}

/// Base store with no keys, for wallets that are HD-only.
pub struct NullKeyStore;

impl BaseKeyStore for NullKeyStore {
    fn have_key(&self, _key_id: &KeyID) -> bool {
        false
    }

    fn get_key(&self, _key_id: &KeyID) -> Option<SecretKey> {
        None
    }

    fn get_pub_key(&self, _key_id: &KeyID) -> Option<PublicKey> {
        None
    }
}

struct StoreInner {
    vault: SeedVault,
    chains: BTreeMap<ChainID, HDChain>,
    hd_pubkeys: BTreeMap<KeyID, HDPubKey>,
}

/// The key store: seeds, chains and the derived-pubkey catalog behind a
/// single mutex, composed with an injected base store for non-HD keys
/// and an injected cipher for seeds at rest.
///
/// The catalog holds public material only; `get_key` re-derives private
/// keys from the seed on demand. Derivation runs outside the mutex, so
/// lookups stay cheap while EC math is in flight.
pub struct HDKeyStore<B, C> {
    base: B,
    cipher: C,
    inner: Mutex<StoreInner>,
}

impl<B: BaseKeyStore, C: SeedCipher> HDKeyStore<B, C> {
    pub fn new(base: B, cipher: C) -> Self {
        HDKeyStore {
            base,
            cipher,
            inner: Mutex::new(StoreInner {
                vault: SeedVault::new(),
                chains: BTreeMap::new(),
                hd_pubkeys: BTreeMap::new(),
            }),
        }
    }

    pub fn cipher(&self) -> &C {
        &self.cipher
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    /// Stores a master seed, wrapped first when the store is encrypted.
    pub fn add_master_seed(
        &self,
        chain_id: ChainID,
        seed: MasterSeed,
    ) -> Result<(), KeyStoreError> {
        let mut inner = self.inner.lock();
        inner.vault.add_master_seed(&self.cipher, chain_id, seed)?;
        debug!(chain = %hex::encode(&chain_id[..4]), "stored master seed");
        Ok(())
    }

    /// Stores an already-wrapped seed, as read back from a wallet file.
    pub fn add_crypted_master_seed(&self, chain_id: ChainID, blob: Vec<u8>) {
        self.inner.lock().vault.add_crypted_master_seed(chain_id, blob);
    }

    /// Copies the seed out of the vault, unwrapping it when encrypted.
    /// The caller owns the copy and its cleanup.
    pub fn get_master_seed(&self, chain_id: &ChainID) -> Result<MasterSeed, KeyStoreError> {
        let inner = self.inner.lock();
        Ok(inner.vault.get_master_seed(&self.cipher, chain_id)?)
    }

    pub fn get_crypted_master_seed(&self, chain_id: &ChainID) -> Result<Vec<u8>, KeyStoreError> {
        let inner = self.inner.lock();
        Ok(inner.vault.get_crypted_master_seed(&self.cipher, chain_id)?)
    }

    /// One-way transition of the vault from plaintext to encrypted.
    /// Fails partway if a wrap fails; calling again finishes the move.
    pub fn encrypt_seeds(&self) -> Result<(), KeyStoreError> {
        let mut inner = self.inner.lock();
        inner.vault.encrypt_seeds(&self.cipher)?;
        info!("master seeds moved to encrypted storage");
        Ok(())
    }

    pub fn get_available_chain_ids(&self) -> Vec<ChainID> {
        self.inner.lock().vault.chain_ids(&self.cipher)
    }

    /// Registers a chain; an existing chain under the same id is replaced.
    pub fn add_chain(&self, chain: HDChain) {
        debug!(
            chain = %hex::encode(&chain.chain_id[..4]),
            template = %chain.keypath_template,
            "registered hd chain"
        );
        self.inner.lock().chains.insert(chain.chain_id, chain);
    }

    pub fn get_chain(&self, chain_id: &ChainID) -> Option<HDChain> {
        self.inner.lock().chains.get(chain_id).cloned()
    }

    /// Inserts a derived-pubkey record into the catalog under the hash of
    /// its public key.
    pub fn load_hd_pubkey(&self, pubkey: HDPubKey) {
        let key_id = pubkey.key_id();
        self.inner.lock().hd_pubkeys.insert(key_id, pubkey);
    }

    pub fn have_key(&self, key_id: &KeyID) -> bool {
        if self.inner.lock().hd_pubkeys.contains_key(key_id) {
            return true;
        }
        self.base.have_key(key_id)
    }

    pub fn get_pub_key(&self, key_id: &KeyID) -> Result<PublicKey, KeyStoreError> {
        if let Some(entry) = self.inner.lock().hd_pubkeys.get(key_id) {
            return Ok(entry.pubkey);
        }
        self.base
            .get_pub_key(key_id)
            .ok_or(KeyStoreError::UnknownKey)
    }

    /// Private key for a key id. Catalog hits are re-derived from the
    /// seed along the record's stored keypath; misses fall through to
    /// the base store.
    pub fn get_key(&self, key_id: &KeyID) -> Result<SecretKey, KeyStoreError> {
        let entry = self.inner.lock().hd_pubkeys.get(key_id).cloned();
        match entry {
            Some(entry) => self.derive_key(&entry),
            None => self.base.get_key(key_id).ok_or(KeyStoreError::UnknownKey),
        }
    }

    /// Derives the public key at `n_index` on the external or internal
    /// subtree of a chain and returns the record describing it. Nothing
    /// is inserted; follow up with `load_hd_pubkey` to keep the result.
    ///
    /// When the requested subtree has a public root, the child comes from
    /// public CKD and the keypath ends in a non-hardened segment. Without
    /// one, the child is derived hardened from the seed and cannot later
    /// be rediscovered from public material alone.
    pub fn derive_hd_pubkey_at_index(
        &self,
        chain_id: &ChainID,
        n_index: u32,
        internal: bool,
    ) -> Result<HDPubKey, KeyStoreError> {
        if n_index >= HARDENED_BIT {
            return Err(KeyStoreError::IndexExhausted);
        }
        let chain = self
            .get_chain(chain_id)
            .ok_or(KeyStoreError::UnknownChain)?;
        let template = KeyPath::from_str(&chain.keypath_template)?;
        let base_path = template.materialize(internal);

        let pub_root = match (
            internal,
            chain.internal_pubkey.as_ref(),
            chain.external_pubkey.as_ref(),
        ) {
            (_, _, None) => None,
            (true, None, _) => None,
            (true, Some(root), Some(_)) => Some(root),
            (false, _, Some(root)) => Some(root),
        };

        let (keypath, pubkey) = match pub_root {
            Some(root) => {
                let path = base_path.with_child(n_index, false);
                let child = root.derive_child(n_index)?;
                (path, child.public_key)
            }
            None => {
                let path = base_path.with_child(n_index, true);
                let ext_key = self.priv_key_der(&path, chain_id)?;
                (path, ext_key.public_key)
            }
        };

        Ok(HDPubKey {
            version: RECORD_VERSION,
            pubkey,
            n_child: n_index,
            chain_id: *chain_id,
            keypath: keypath.to_string(),
            internal,
        })
    }

    /// Smallest child index on `(chain_id, internal)` with no catalog
    /// entry. Gaps are filled before new indices are handed out: a
    /// catalog holding 0, 1, 2 and 100 yields 3.
    pub fn get_next_child_index(&self, chain_id: &ChainID, internal: bool) -> u32 {
        let mut used: Vec<u32> = {
            let inner = self.inner.lock();
            inner
                .hd_pubkeys
                .values()
                .filter(|entry| entry.chain_id == *chain_id && entry.internal == internal)
                .map(|entry| entry.n_child)
                .collect()
        };
        used.sort_unstable();
        used.dedup();

        let mut next = 0u32;
        for index in used {
            if index == next {
                next += 1;
            } else if index > next {
                break;
            }
        }
        next
    }

    /// Rebuilds the extended private key at a materialized keypath. The
    /// mutex is held only while the seed is copied out; the walk itself
    /// runs unlocked.
    fn priv_key_der(
        &self,
        path: &KeyPath,
        chain_id: &ChainID,
    ) -> Result<ExtendedKey, KeyStoreError> {
        let indices = path.derivation_indices()?;
        let seed = self.get_master_seed(chain_id)?;
        let master = ExtendedKey::from_master_seed(seed.as_bytes())?;
        Ok(master.derive_indices(&indices)?)
    }

    /// Re-derives the private key behind a catalog record.
    fn derive_key(&self, entry: &HDPubKey) -> Result<SecretKey, KeyStoreError> {
        let path = KeyPath::from_str(&entry.keypath)?;
        let ext_key = self.priv_key_der(&path, &entry.chain_id)?;
        Ok(ext_key.private_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::Secp256k1;

    use crate::cipher::PassphraseCipher;
    use crate::derivation::ExtendedPubKey;
    use crate::records::key_id;

    const SEED: &str = "000102030405060708090a0b0c0d0e0f";
    const PASSPHRASE: &str = "correct horse battery staple";

    fn seed_bytes() -> Vec<u8> {
        hex::decode(SEED).unwrap()
    }

    fn master() -> ExtendedKey {
        ExtendedKey::from_seed(&seed_bytes()).unwrap()
    }

    fn priv_at(path: &str) -> ExtendedKey {
        let indices = KeyPath::from_str(path)
            .unwrap()
            .derivation_indices()
            .unwrap();
        master().derive_indices(&indices).unwrap()
    }

    fn root_at(path: &str) -> ExtendedPubKey {
        priv_at(path).neuter()
    }

    type TestStore = HDKeyStore<NullKeyStore, PassphraseCipher>;

    /// Store holding the test-vector seed and one chain built from
    /// `template`, with public subtree roots at the given paths.
    fn store_with_chain(
        template: &str,
        external: Option<&str>,
        internal: Option<&str>,
    ) -> (TestStore, ChainID) {
        let store = HDKeyStore::new(NullKeyStore, PassphraseCipher::new());
        let chain_id = master().neuter().chain_id();
        store
            .add_master_seed(chain_id, MasterSeed::new(seed_bytes()))
            .unwrap();

        let mut chain = HDChain::new(chain_id, template, 0);
        if let Some(path) = external {
            chain.external_pubkey = Some(root_at(path));
            chain.use_pub_ckd = true;
        }
        if let Some(path) = internal {
            chain.internal_pubkey = Some(root_at(path));
        }
        store.add_chain(chain);
        (store, chain_id)
    }

    #[test]
    fn external_derivation_uses_public_ckd() {
        let (store, chain_id) = store_with_chain("m/0'/c", Some("m/0'/0"), Some("m/0'/1"));
        let entry = store
            .derive_hd_pubkey_at_index(&chain_id, 0, false)
            .unwrap();

        assert_eq!(entry.keypath, "m/0'/0/0");
        assert_eq!(entry.n_child, 0);
        assert!(!entry.internal);
        assert_eq!(entry.pubkey, priv_at("m/0'/0/0").public_key);
    }

    #[test]
    fn internal_derivation_uses_internal_root() {
        let (store, chain_id) = store_with_chain("m/0'/c", Some("m/0'/0"), Some("m/0'/1"));
        let entry = store.derive_hd_pubkey_at_index(&chain_id, 5, true).unwrap();

        assert_eq!(entry.keypath, "m/0'/1/5");
        assert!(entry.internal);
        assert_eq!(entry.pubkey, priv_at("m/0'/1/5").public_key);
    }

    #[test]
    fn missing_internal_root_falls_back_to_hardened_derivation() {
        let (store, chain_id) = store_with_chain("m/0'/c", Some("m/0'/0"), None);
        let entry = store.derive_hd_pubkey_at_index(&chain_id, 5, true).unwrap();

        assert_eq!(entry.keypath, "m/0'/1/5'");
        assert_eq!(entry.pubkey, priv_at("m/0'/1/5'").public_key);
    }

    #[test]
    fn chain_without_roots_derives_hardened_from_seed() {
        let (store, chain_id) = store_with_chain("m/0'/c", None, None);
        let entry = store
            .derive_hd_pubkey_at_index(&chain_id, 0, false)
            .unwrap();

        assert_eq!(entry.keypath, "m/0'/0/0'");
        assert_eq!(entry.pubkey, priv_at("m/0'/0/0'").public_key);
    }

    #[test]
    fn template_without_switch_appends_index() {
        let (store, chain_id) =
            store_with_chain("m/44'/0'/0'", Some("m/44'/0'/0'"), None);
        let entry = store
            .derive_hd_pubkey_at_index(&chain_id, 7, false)
            .unwrap();

        assert_eq!(entry.keypath, "m/44'/0'/0'/7");
        assert_eq!(entry.pubkey, priv_at("m/44'/0'/0'/7").public_key);
    }

    #[test]
    fn index_boundaries() {
        let (store, chain_id) = store_with_chain("m/0'/c", Some("m/0'/0"), None);
        assert!(store
            .derive_hd_pubkey_at_index(&chain_id, 0x7fff_ffff, false)
            .is_ok());
        assert!(matches!(
            store.derive_hd_pubkey_at_index(&chain_id, 0x8000_0000, false),
            Err(KeyStoreError::IndexExhausted)
        ));
    }

    #[test]
    fn unknown_chain_fails_and_inserts_nothing() {
        let (store, _) = store_with_chain("m/0'/c", Some("m/0'/0"), None);
        assert!(matches!(
            store.derive_hd_pubkey_at_index(&[0xee; 32], 0, false),
            Err(KeyStoreError::UnknownChain)
        ));
        assert!(store.inner.lock().hd_pubkeys.is_empty());
    }

    #[test]
    fn derive_does_not_insert_into_catalog() {
        let (store, chain_id) = store_with_chain("m/0'/c", Some("m/0'/0"), None);
        let entry = store
            .derive_hd_pubkey_at_index(&chain_id, 0, false)
            .unwrap();
        assert!(!store.have_key(&entry.key_id()));

        store.load_hd_pubkey(entry.clone());
        assert!(store.have_key(&entry.key_id()));
        assert_eq!(store.get_pub_key(&entry.key_id()).unwrap(), entry.pubkey);
    }

    #[test]
    fn get_key_rederives_private_material() {
        let (store, chain_id) = store_with_chain("m/0'/c", Some("m/0'/0"), Some("m/0'/1"));
        for (index, internal) in [(0, false), (3, false), (1, true)] {
            let entry = store
                .derive_hd_pubkey_at_index(&chain_id, index, internal)
                .unwrap();
            store.load_hd_pubkey(entry.clone());

            let secret = store.get_key(&entry.key_id()).unwrap();
            let derived_pub = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
            assert_eq!(derived_pub, entry.pubkey);
        }
    }

    #[test]
    fn next_child_index_fills_gaps() {
        let (store, chain_id) = store_with_chain("m/0'/c", Some("m/0'/0"), Some("m/0'/1"));
        assert_eq!(store.get_next_child_index(&chain_id, false), 0);

        for index in [0, 2] {
            let entry = store
                .derive_hd_pubkey_at_index(&chain_id, index, false)
                .unwrap();
            store.load_hd_pubkey(entry);
        }
        assert_eq!(store.get_next_child_index(&chain_id, false), 1);

        for index in [1, 100] {
            let entry = store
                .derive_hd_pubkey_at_index(&chain_id, index, false)
                .unwrap();
            store.load_hd_pubkey(entry);
        }
        assert_eq!(store.get_next_child_index(&chain_id, false), 3);

        // internal entries are counted separately
        assert_eq!(store.get_next_child_index(&chain_id, true), 0);
        let entry = store.derive_hd_pubkey_at_index(&chain_id, 0, true).unwrap();
        store.load_hd_pubkey(entry);
        assert_eq!(store.get_next_child_index(&chain_id, true), 1);
        assert_eq!(store.get_next_child_index(&chain_id, false), 3);
    }

    #[test]
    fn encrypt_seeds_then_lock_and_unlock() {
        let (store, chain_id) = store_with_chain("m/0'/c", Some("m/0'/0"), None);
        let entry = store
            .derive_hd_pubkey_at_index(&chain_id, 0, false)
            .unwrap();
        store.load_hd_pubkey(entry.clone());

        assert!(matches!(
            store.get_crypted_master_seed(&chain_id),
            Err(KeyStoreError::NotCrypted)
        ));

        store.cipher().enable(PASSPHRASE);
        store.encrypt_seeds().unwrap();
        store.cipher().lock();

        assert!(matches!(
            store.get_master_seed(&chain_id),
            Err(KeyStoreError::Locked)
        ));
        assert!(matches!(
            store.get_key(&entry.key_id()),
            Err(KeyStoreError::Locked)
        ));
        // public-root derivation keeps working while locked
        assert!(store
            .derive_hd_pubkey_at_index(&chain_id, 1, false)
            .is_ok());

        store.cipher().unlock(PASSPHRASE);
        assert_eq!(
            store.get_master_seed(&chain_id).unwrap().as_bytes(),
            seed_bytes().as_slice()
        );
        assert!(store.get_key(&entry.key_id()).is_ok());

        // the wrapped blob unwraps back to the stored seed
        let blob = store.get_crypted_master_seed(&chain_id).unwrap();
        let unwrapped = store.cipher().decrypt_seed(&chain_id, &blob).unwrap();
        assert_eq!(unwrapped.as_bytes(), seed_bytes().as_slice());
    }

    #[test]
    fn wrong_passphrase_stays_locked() {
        let (store, chain_id) = store_with_chain("m/0'/c", None, None);
        store.cipher().enable(PASSPHRASE);
        store.encrypt_seeds().unwrap();
        store.cipher().lock();
        store.cipher().unlock("not the passphrase");
        assert!(matches!(
            store.get_master_seed(&chain_id),
            Err(KeyStoreError::Locked)
        ));
    }

    #[test]
    fn encrypt_seeds_requires_unlocked_cipher() {
        let (store, _) = store_with_chain("m/0'/c", None, None);
        store.cipher().enable(PASSPHRASE);
        store.cipher().lock();
        assert!(matches!(
            store.encrypt_seeds(),
            Err(KeyStoreError::Locked)
        ));
        // retry after unlocking converges
        store.cipher().unlock(PASSPHRASE);
        store.encrypt_seeds().unwrap();
    }

    #[test]
    fn encoded_extkey_seed_derives_identically() {
        let (raw_store, chain_id) = store_with_chain("m/0'/c", None, None);
        let raw_entry = raw_store
            .derive_hd_pubkey_at_index(&chain_id, 2, false)
            .unwrap();

        let encoded_store = HDKeyStore::new(NullKeyStore, PassphraseCipher::new());
        encoded_store
            .add_master_seed(chain_id, MasterSeed::new(master().encode().to_vec()))
            .unwrap();
        encoded_store.add_chain(HDChain::new(chain_id, "m/0'/c", 0));
        let encoded_entry = encoded_store
            .derive_hd_pubkey_at_index(&chain_id, 2, false)
            .unwrap();

        assert_eq!(raw_entry.pubkey, encoded_entry.pubkey);
        assert_eq!(raw_entry.keypath, encoded_entry.keypath);
    }

    #[test]
    fn available_chain_ids_track_vault_state() {
        let (store, chain_id) = store_with_chain("m/0'/c", None, None);
        assert_eq!(store.get_available_chain_ids(), vec![chain_id]);
        store.cipher().enable(PASSPHRASE);
        store.encrypt_seeds().unwrap();
        assert_eq!(store.get_available_chain_ids(), vec![chain_id]);
    }

    #[test]
    fn catalog_key_is_hash_of_stored_pubkey() {
        let (store, chain_id) = store_with_chain("m/0'/c", Some("m/0'/0"), None);
        let entry = store
            .derive_hd_pubkey_at_index(&chain_id, 0, false)
            .unwrap();
        let id = entry.key_id();
        store.load_hd_pubkey(entry);
        let stored = store.get_pub_key(&id).unwrap();
        assert_eq!(key_id(&stored), id);
    }

    /// One fixed key behind the base-store interface.
    struct StubBase {
        secret: SecretKey,
        pubkey: PublicKey,
    }

    impl StubBase {
        fn new() -> Self {
            let secp = Secp256k1::new();
            let secret = SecretKey::from_slice(&[0x51; 32]).unwrap();
            let pubkey = PublicKey::from_secret_key(&secp, &secret);
            StubBase { secret, pubkey }
        }
    }

    impl BaseKeyStore for StubBase {
        fn have_key(&self, key_id_in: &KeyID) -> bool {
            *key_id_in == key_id(&self.pubkey)
        }

        fn get_key(&self, key_id_in: &KeyID) -> Option<SecretKey> {
            self.have_key(key_id_in).then_some(self.secret)
        }

        fn get_pub_key(&self, key_id_in: &KeyID) -> Option<PublicKey> {
            self.have_key(key_id_in).then_some(self.pubkey)
        }
    }

    #[test]
    fn catalog_misses_fall_through_to_base_store() {
        let base = StubBase::new();
        let base_id = key_id(&base.pubkey);
        let base_pub = base.pubkey;
        let store = HDKeyStore::new(base, PassphraseCipher::new());

        assert!(store.have_key(&base_id));
        assert_eq!(store.get_pub_key(&base_id).unwrap(), base_pub);
        assert!(store.get_key(&base_id).is_ok());

        let absent = [0xde; 20];
        assert!(!store.have_key(&absent));
        assert!(matches!(
            store.get_pub_key(&absent),
            Err(KeyStoreError::UnknownKey)
        ));
        assert!(matches!(
            store.get_key(&absent),
            Err(KeyStoreError::UnknownKey)
        ));
    }
}
