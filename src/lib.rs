//! In-memory custodian for BIP32 hierarchical deterministic key trees:
//! master seeds keyed by chain id, a catalog of derived public keys, and
//! on-demand private-key re-derivation behind a single store mutex.

pub mod cipher;
pub mod derivation;
pub mod keypath;
pub mod keystore;
pub mod records;
pub mod vault;

pub use cipher::PassphraseCipher;
pub use derivation::{DerivationError, ExtendedKey, ExtendedPubKey, BIP32_EXTKEY_SIZE};
pub use keypath::{KeyPath, KeyPathError, PathSegment, HARDENED_BIT, MAX_PATH_DEPTH};
pub use keystore::{BaseKeyStore, HDKeyStore, KeyStoreError, NullKeyStore};
pub use records::{key_id, ChainID, DecodeError, HDChain, HDPubKey, KeyID, RECORD_VERSION};
pub use vault::{MasterSeed, SeedCipher, SeedVault, VaultError};
