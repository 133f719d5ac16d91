use std::collections::BTreeMap;
use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::records::ChainID;

/// Raw master seed material: either entropy for BIP32 master-key
/// derivation or a 74-byte encoded extended private key. The vault keeps
/// whichever form it was given, untouched, and wipes it on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterSeed(Vec<u8>);

impl MasterSeed {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for MasterSeed {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Symmetric envelope around seeds at rest. The chain id accompanies
/// every call so implementations can bind the wrapping (nonce, tag) to
/// the seed it covers. `None` means the wrapping key is unavailable.
pub trait SeedCipher {
    fn is_crypted(&self) -> bool;
    fn encrypt_seed(&self, chain_id: &ChainID, plain: &MasterSeed) -> Option<Vec<u8>>;
    fn decrypt_seed(&self, chain_id: &ChainID, blob: &[u8]) -> Option<MasterSeed>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum VaultError {
    UnknownChain,
    Locked,
    NotCrypted,
}

impl fmt::Display for VaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultError::UnknownChain => write!(f, "no seed stored for this chain id"),
            VaultError::Locked => write!(f, "seed unavailable while the cipher is locked"),
            VaultError::NotCrypted => write!(f, "vault holds no encrypted seeds"),
        }
    }
}

impl std::error::Error for VaultError {}

/// Master seeds keyed by chain id. Exactly one of the two maps is
/// authoritative at any time, selected by the cipher's `is_crypted`;
/// no chain id ever appears in both.
#[derive(Default)]
pub struct SeedVault {
    plain: BTreeMap<ChainID, MasterSeed>,
    crypted: BTreeMap<ChainID, Vec<u8>>,
}

impl SeedVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a seed, wrapping it first when the store is encrypted.
    /// Re-inserting under an existing chain id overwrites.
    pub fn add_master_seed(
        &mut self,
        cipher: &dyn SeedCipher,
        chain_id: ChainID,
        seed: MasterSeed,
    ) -> Result<(), VaultError> {
        if cipher.is_crypted() {
            let blob = cipher
                .encrypt_seed(&chain_id, &seed)
                .ok_or(VaultError::Locked)?;
            self.crypted.insert(chain_id, blob);
            return Ok(());
        }
        self.plain.insert(chain_id, seed);
        Ok(())
    }

    /// Stores an already-wrapped seed, as read back from a wallet file.
    pub fn add_crypted_master_seed(&mut self, chain_id: ChainID, blob: Vec<u8>) {
        self.crypted.insert(chain_id, blob);
    }

    pub fn get_master_seed(
        &self,
        cipher: &dyn SeedCipher,
        chain_id: &ChainID,
    ) -> Result<MasterSeed, VaultError> {
        if !cipher.is_crypted() {
            return self
                .plain
                .get(chain_id)
                .cloned()
                .ok_or(VaultError::UnknownChain);
        }
        let blob = self.crypted.get(chain_id).ok_or(VaultError::UnknownChain)?;
        cipher
            .decrypt_seed(chain_id, blob)
            .ok_or(VaultError::Locked)
    }

    pub fn get_crypted_master_seed(
        &self,
        cipher: &dyn SeedCipher,
        chain_id: &ChainID,
    ) -> Result<Vec<u8>, VaultError> {
        if !cipher.is_crypted() {
            return Err(VaultError::NotCrypted);
        }
        self.crypted
            .get(chain_id)
            .cloned()
            .ok_or(VaultError::UnknownChain)
    }

    /// Moves every plaintext seed into the crypted map. Entries move one
    /// at a time, crypted insert before plaintext removal, so a failed
    /// wrap leaves the vault consistent and a retry finishes the
    /// transition.
    pub fn encrypt_seeds(&mut self, cipher: &dyn SeedCipher) -> Result<(), VaultError> {
        let pending: Vec<ChainID> = self.plain.keys().copied().collect();
        for chain_id in pending {
            if !self.crypted.contains_key(&chain_id) {
                let blob = match self.plain.get(&chain_id) {
                    Some(seed) => cipher
                        .encrypt_seed(&chain_id, seed)
                        .ok_or(VaultError::Locked)?,
                    None => continue,
                };
                self.crypted.insert(chain_id, blob);
            }
            self.plain.remove(&chain_id);
        }
        Ok(())
    }

    /// Chain ids present in whichever map is authoritative right now.
    pub fn chain_ids(&self, cipher: &dyn SeedCipher) -> Vec<ChainID> {
        if cipher.is_crypted() {
            self.crypted.keys().copied().collect()
        } else {
            self.plain.keys().copied().collect()
        }
    }
}
