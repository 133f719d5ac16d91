use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use bitcoin_hashes::{sha256, Hash};
use parking_lot::Mutex;
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::records::ChainID;
use crate::vault::{MasterSeed, SeedCipher};

const PBKDF2_ROUNDS: u32 = 10_000;
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;

/// Passphrase-based seed envelope: PBKDF2-HMAC-SHA256 stretches the
/// passphrase into an AES-256-GCM key, and each seed is wrapped under a
/// nonce taken from SHA-256 of its chain id, so blobs need no per-entry
/// framing.
///
/// The envelope starts in plaintext mode. `enable` switches it to
/// encrypted mode and leaves it unlocked; `lock` drops the wrapping key
/// until the next `unlock`. A wrong unlock passphrase only shows up when
/// a blob later fails to authenticate.
pub struct PassphraseCipher {
    salt: [u8; SALT_SIZE],
    state: Mutex<CipherState>,
}

struct CipherState {
    crypted: bool,
    key: Option<Zeroizing<[u8; 32]>>,
}

impl PassphraseCipher {
    /// Plaintext mode with a fresh random salt.
    pub fn new() -> Self {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        Self::with_salt(salt)
    }

    /// Rebuilds the envelope around a previously stored salt.
    pub fn with_salt(salt: [u8; SALT_SIZE]) -> Self {
        PassphraseCipher {
            salt,
            state: Mutex::new(CipherState {
                crypted: false,
                key: None,
            }),
        }
    }

    /// The salt to persist alongside the wrapped seeds.
    pub fn salt(&self) -> [u8; SALT_SIZE] {
        self.salt
    }

    /// Switches to encrypted mode, unlocked under the given passphrase.
    pub fn enable(&self, passphrase: &str) {
        let mut state = self.state.lock();
        state.key = Some(self.derive_key(passphrase));
        state.crypted = true;
    }

    /// Drops the wrapping key.
    pub fn lock(&self) {
        self.state.lock().key = None;
    }

    /// Re-derives the wrapping key from a passphrase.
    pub fn unlock(&self, passphrase: &str) {
        self.state.lock().key = Some(self.derive_key(passphrase));
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().key.is_none()
    }

    fn derive_key(&self, passphrase: &str) -> Zeroizing<[u8; 32]> {
        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), &self.salt, PBKDF2_ROUNDS, &mut key[..]);
        key
    }

    fn nonce_for(chain_id: &ChainID) -> [u8; NONCE_SIZE] {
        let digest = sha256::Hash::hash(chain_id).to_byte_array();
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&digest[..NONCE_SIZE]);
        nonce
    }
}

impl Default for PassphraseCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl SeedCipher for PassphraseCipher {
    fn is_crypted(&self) -> bool {
        self.state.lock().crypted
    }

    fn encrypt_seed(&self, chain_id: &ChainID, plain: &MasterSeed) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let key = state.key.as_deref()?;
        let cipher = Aes256Gcm::new_from_slice(key).ok()?;
        let nonce = Self::nonce_for(chain_id);
        cipher.encrypt(Nonce::from_slice(&nonce), plain.as_bytes()).ok()
    }

    fn decrypt_seed(&self, chain_id: &ChainID, blob: &[u8]) -> Option<MasterSeed> {
        let state = self.state.lock();
        let key = state.key.as_deref()?;
        let cipher = Aes256Gcm::new_from_slice(key).ok()?;
        let nonce = Self::nonce_for(chain_id);
        cipher
            .decrypt(Nonce::from_slice(&nonce), blob)
            .ok()
            .map(MasterSeed::new)
    }
}
