use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};
use sha2::Sha512;
use std::fmt;
use bitcoin_hashes::{hash160, sha256, Hash};

use crate::keypath::HARDENED_BIT;
use crate::records::ChainID;

/// Serialized length of an extended key: depth, parent fingerprint,
/// child number, chain code and the 33-byte key field.
pub const BIP32_EXTKEY_SIZE: usize = 74;

#[derive(Debug)]
pub enum DerivationError {
    HardenedFromPublic,
    InvalidEncoding,
    KeyDerivationFailed,
    HmacError,
    Secp256k1Error,
}

impl fmt::Display for DerivationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DerivationError::HardenedFromPublic => {
                write!(f, "Hardened derivation requires the parent private key")
            }
            DerivationError::InvalidEncoding => write!(f, "Invalid extended key encoding"),
            DerivationError::KeyDerivationFailed => write!(f, "Key derivation failed"),
            DerivationError::HmacError => write!(f, "HMAC operation failed"),
            DerivationError::Secp256k1Error => write!(f, "Secp256k1 operation failed"),
        }
    }
}

impl std::error::Error for DerivationError {}

/// A BIP32 extended private key: the key pair plus the chain code and
/// the metadata that goes into its serialized form.
#[derive(Clone)]
pub struct ExtendedKey {
    pub private_key: SecretKey,
    pub public_key: PublicKey,
    pub chain_code: [u8; 32],
    pub depth: u8,
    pub parent_fingerprint: [u8; 4],
    pub child_number: u32,
}

impl ExtendedKey {
    /// Creates a new master key from raw seed entropy.
    pub fn from_seed(seed: &[u8]) -> Result<Self, DerivationError> {
        let secp = Secp256k1::new();

        // HMAC-SHA512 with key "Bitcoin seed"
        let mut hmac = Hmac::<Sha512>::new_from_slice(b"Bitcoin seed")
            .map_err(|_| DerivationError::HmacError)?;

        hmac.update(seed);
        let result = hmac.finalize().into_bytes();

        let mut left = [0u8; 32];
        let mut chain_code = [0u8; 32];
        left.copy_from_slice(&result[0..32]);
        chain_code.copy_from_slice(&result[32..64]);

        let private_key =
            SecretKey::from_slice(&left).map_err(|_| DerivationError::Secp256k1Error)?;
        let public_key = PublicKey::from_secret_key(&secp, &private_key);

        Ok(ExtendedKey {
            private_key,
            public_key,
            chain_code,
            depth: 0,
            parent_fingerprint: [0u8; 4],
            child_number: 0,
        })
    }

    /// Builds the working master key for a stored seed. A buffer of
    /// exactly `BIP32_EXTKEY_SIZE` bytes is an encoded extended private
    /// key; any other length is raw entropy.
    pub fn from_master_seed(seed: &[u8]) -> Result<Self, DerivationError> {
        if seed.len() == BIP32_EXTKEY_SIZE {
            let mut buf = [0u8; BIP32_EXTKEY_SIZE];
            buf.copy_from_slice(seed);
            Self::decode(&buf)
        } else {
            Self::from_seed(seed)
        }
    }

    pub fn decode(data: &[u8; BIP32_EXTKEY_SIZE]) -> Result<Self, DerivationError> {
        // the key field of a private encoding is 0x00 || key
        if data[41] != 0 {
            return Err(DerivationError::InvalidEncoding);
        }
        let secp = Secp256k1::new();
        let mut parent_fingerprint = [0u8; 4];
        parent_fingerprint.copy_from_slice(&data[1..5]);
        let child_number = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&data[9..41]);
        let private_key =
            SecretKey::from_slice(&data[42..74]).map_err(|_| DerivationError::InvalidEncoding)?;

        Ok(ExtendedKey {
            public_key: PublicKey::from_secret_key(&secp, &private_key),
            private_key,
            chain_code,
            depth: data[0],
            parent_fingerprint,
            child_number,
        })
    }

    pub fn encode(&self) -> [u8; BIP32_EXTKEY_SIZE] {
        let mut out = [0u8; BIP32_EXTKEY_SIZE];
        out[0] = self.depth;
        out[1..5].copy_from_slice(&self.parent_fingerprint);
        out[5..9].copy_from_slice(&self.child_number.to_be_bytes());
        out[9..41].copy_from_slice(&self.chain_code);
        out[41] = 0;
        out[42..74].copy_from_slice(&self.private_key.secret_bytes());
        out
    }

    /// Derives the child key at the given raw index (hardened bit included).
    pub fn derive_child(&self, index: u32) -> Result<Self, DerivationError> {
        let secp = Secp256k1::new();

        // 33 bytes of key material plus 4 bytes of index
        let mut data = Vec::with_capacity(37);

        if index & HARDENED_BIT != 0 {
            // Hardened derivation
            data.push(0);
            data.extend_from_slice(&self.private_key.secret_bytes());
        } else {
            // Normal derivation
            data.extend_from_slice(&self.public_key.serialize());
        }

        // Append the index in big-endian
        data.extend_from_slice(&index.to_be_bytes());

        let mut hmac = Hmac::<Sha512>::new_from_slice(&self.chain_code)
            .map_err(|_| DerivationError::HmacError)?;

        hmac.update(&data);
        let result = hmac.finalize().into_bytes();

        let mut left = [0u8; 32];
        let mut chain_code = [0u8; 32];
        left.copy_from_slice(&result[0..32]);
        chain_code.copy_from_slice(&result[32..64]);

        // Tweak the parent private key by the left half
        let tweak =
            SecretKey::from_slice(&left).map_err(|_| DerivationError::KeyDerivationFailed)?;
        let child_private_key = self
            .private_key
            .add_tweak(&Scalar::from(tweak))
            .map_err(|_| DerivationError::KeyDerivationFailed)?;
        let child_public_key = PublicKey::from_secret_key(&secp, &child_private_key);

        Ok(ExtendedKey {
            private_key: child_private_key,
            public_key: child_public_key,
            chain_code,
            depth: self.depth + 1,
            parent_fingerprint: self.fingerprint(),
            child_number: index,
        })
    }

    /// Walks a list of raw child indices left to right.
    pub fn derive_indices(&self, indices: &[u32]) -> Result<Self, DerivationError> {
        let mut key = self.clone();
        for &index in indices {
            key = key.derive_child(index)?;
        }
        Ok(key)
    }

    /// Calculates the fingerprint of this key
    pub fn fingerprint(&self) -> [u8; 4] {
        let mut result = [0u8; 4];
        let hash = hash160::Hash::hash(&self.public_key.serialize());
        result.copy_from_slice(&hash.to_byte_array()[0..4]);
        result
    }

    /// Projects to the extended public key, dropping private material.
    pub fn neuter(&self) -> ExtendedPubKey {
        ExtendedPubKey {
            public_key: self.public_key,
            chain_code: self.chain_code,
            depth: self.depth,
            parent_fingerprint: self.parent_fingerprint,
            child_number: self.child_number,
        }
    }
}

/// A BIP32 extended public key. Supports non-hardened child derivation
/// only; the chain records store these as the external and internal
/// subtree roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedPubKey {
    pub public_key: PublicKey,
    pub chain_code: [u8; 32],
    pub depth: u8,
    pub parent_fingerprint: [u8; 4],
    pub child_number: u32,
}

impl ExtendedPubKey {
    /// Public CKD. Fails on hardened indices, which need the private key.
    pub fn derive_child(&self, index: u32) -> Result<Self, DerivationError> {
        if index & HARDENED_BIT != 0 {
            return Err(DerivationError::HardenedFromPublic);
        }
        let secp = Secp256k1::new();

        let mut data = Vec::with_capacity(37);
        data.extend_from_slice(&self.public_key.serialize());
        data.extend_from_slice(&index.to_be_bytes());

        let mut hmac = Hmac::<Sha512>::new_from_slice(&self.chain_code)
            .map_err(|_| DerivationError::HmacError)?;

        hmac.update(&data);
        let result = hmac.finalize().into_bytes();

        let mut left = [0u8; 32];
        let mut chain_code = [0u8; 32];
        left.copy_from_slice(&result[0..32]);
        chain_code.copy_from_slice(&result[32..64]);

        // point(left) + parent; fails on the point at infinity
        let tweak =
            SecretKey::from_slice(&left).map_err(|_| DerivationError::KeyDerivationFailed)?;
        let child_public_key = self
            .public_key
            .add_exp_tweak(&secp, &Scalar::from(tweak))
            .map_err(|_| DerivationError::KeyDerivationFailed)?;

        Ok(ExtendedPubKey {
            public_key: child_public_key,
            chain_code,
            depth: self.depth + 1,
            parent_fingerprint: self.fingerprint(),
            child_number: index,
        })
    }

    pub fn decode(data: &[u8; BIP32_EXTKEY_SIZE]) -> Result<Self, DerivationError> {
        let mut parent_fingerprint = [0u8; 4];
        parent_fingerprint.copy_from_slice(&data[1..5]);
        let child_number = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&data[9..41]);
        let public_key =
            PublicKey::from_slice(&data[41..74]).map_err(|_| DerivationError::InvalidEncoding)?;

        Ok(ExtendedPubKey {
            public_key,
            chain_code,
            depth: data[0],
            parent_fingerprint,
            child_number,
        })
    }

    pub fn encode(&self) -> [u8; BIP32_EXTKEY_SIZE] {
        let mut out = [0u8; BIP32_EXTKEY_SIZE];
        out[0] = self.depth;
        out[1..5].copy_from_slice(&self.parent_fingerprint);
        out[5..9].copy_from_slice(&self.child_number.to_be_bytes());
        out[9..41].copy_from_slice(&self.chain_code);
        out[41..74].copy_from_slice(&self.public_key.serialize());
        out
    }

    /// Calculates the fingerprint of this key
    pub fn fingerprint(&self) -> [u8; 4] {
        let mut result = [0u8; 4];
        let hash = hash160::Hash::hash(&self.public_key.serialize());
        result.copy_from_slice(&hash.to_byte_array()[0..4]);
        result
    }

    /// Chain identifier of the tree rooted here: SHA-256 of the encoded
    /// master public key.
    pub fn chain_id(&self) -> ChainID {
        sha256::Hash::hash(&self.encode()).to_byte_array()
    }
}
