use std::fmt;

use bitcoin_hashes::{hash160, Hash};
use secp256k1::PublicKey;

use crate::derivation::{ExtendedPubKey, BIP32_EXTKEY_SIZE};

/// 256-bit chain identifier: hash of the chain's master extended public key.
pub type ChainID = [u8; 32];

/// 160-bit key identifier: hash160 of a compressed public key.
pub type KeyID = [u8; 20];

/// Version written into freshly created records.
pub const RECORD_VERSION: i32 = 1;

// fields larger than this are rejected while decoding
const MAX_FIELD_SIZE: u64 = 0x0200_0000;

pub fn key_id(pubkey: &PublicKey) -> KeyID {
    hash160::Hash::hash(&pubkey.serialize()).to_byte_array()
}

#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEnd,
    InvalidPubKey,
    InvalidString,
    OversizedField(u64),
    TrailingData,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEnd => write!(f, "record ends before its last field"),
            DecodeError::InvalidPubKey => write!(f, "record holds an invalid public key"),
            DecodeError::InvalidString => write!(f, "record holds a non-UTF-8 string"),
            DecodeError::OversizedField(n) => write!(f, "field length {} exceeds the limit", n),
            DecodeError::TrailingData => write!(f, "record has trailing bytes"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A chain of keys: the derivation template plus the public roots of the
/// external and internal subtrees. `None` roots mean the subtree can only
/// be reached through private derivation from the seed.
#[derive(Debug, Clone)]
pub struct HDChain {
    pub version: i32,
    pub create_time: i64,
    pub chain_id: ChainID,
    pub keypath_template: String,
    pub use_pub_ckd: bool,
    pub external_pubkey: Option<ExtendedPubKey>,
    pub internal_pubkey: Option<ExtendedPubKey>,
}

impl HDChain {
    /// A private-derivation chain; callers set the public roots and
    /// `use_pub_ckd` when watch-only address generation is wanted.
    pub fn new(chain_id: ChainID, keypath_template: impl Into<String>, create_time: i64) -> Self {
        HDChain {
            version: RECORD_VERSION,
            create_time,
            chain_id,
            keypath_template: keypath_template.into(),
            use_pub_ckd: false,
            external_pubkey: None,
            internal_pubkey: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        if self.use_pub_ckd && self.external_pubkey.is_none() {
            return false;
        }
        !self.keypath_template.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + 2 * BIP32_EXTKEY_SIZE);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.create_time.to_le_bytes());
        out.extend_from_slice(&self.chain_id);
        write_compact_size(&mut out, self.keypath_template.len() as u64);
        out.extend_from_slice(self.keypath_template.as_bytes());
        out.push(self.use_pub_ckd as u8);
        if self.use_pub_ckd {
            write_opt_root(&mut out, &self.external_pubkey);
            write_opt_root(&mut out, &self.internal_pubkey);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(data);
        let version = reader.i32_le()?;
        let create_time = reader.i64_le()?;
        let mut chain_id = [0u8; 32];
        chain_id.copy_from_slice(reader.take(32)?);
        let keypath_template = reader.string()?;
        let use_pub_ckd = reader.u8()? != 0;
        let (external_pubkey, internal_pubkey) = if use_pub_ckd {
            (read_opt_root(&mut reader)?, read_opt_root(&mut reader)?)
        } else {
            (None, None)
        };
        reader.finish()?;

        Ok(HDChain {
            version,
            create_time,
            chain_id,
            keypath_template,
            use_pub_ckd,
            external_pubkey,
            internal_pubkey,
        })
    }
}

/// A derived public key together with the coordinates that reproduce it:
/// the owning chain, the materialized keypath and the final child index.
/// Records are immutable once created.
#[derive(Debug, Clone)]
pub struct HDPubKey {
    pub version: i32,
    pub pubkey: PublicKey,
    pub n_child: u32,
    pub chain_id: ChainID,
    pub keypath: String,
    pub internal: bool,
}

impl HDPubKey {
    pub fn key_id(&self) -> KeyID {
        key_id(&self.pubkey)
    }

    pub fn encode(&self) -> Vec<u8> {
        let pubkey = self.pubkey.serialize();
        let mut out = Vec::with_capacity(48 + pubkey.len() + self.keypath.len());
        out.extend_from_slice(&self.version.to_le_bytes());
        write_compact_size(&mut out, pubkey.len() as u64);
        out.extend_from_slice(&pubkey);
        out.extend_from_slice(&self.n_child.to_le_bytes());
        out.extend_from_slice(&self.chain_id);
        write_compact_size(&mut out, self.keypath.len() as u64);
        out.extend_from_slice(self.keypath.as_bytes());
        out.push(self.internal as u8);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(data);
        let version = reader.i32_le()?;
        let pubkey =
            PublicKey::from_slice(reader.bytes()?).map_err(|_| DecodeError::InvalidPubKey)?;
        let n_child = reader.u32_le()?;
        let mut chain_id = [0u8; 32];
        chain_id.copy_from_slice(reader.take(32)?);
        let keypath = reader.string()?;
        let internal = reader.u8()? != 0;
        reader.finish()?;

        Ok(HDPubKey {
            version,
            pubkey,
            n_child,
            chain_id,
            keypath,
            internal,
        })
    }
}

// A missing root is written as an all-zero block, which can never decode
// as a point on the curve.
fn write_opt_root(out: &mut Vec<u8>, root: &Option<ExtendedPubKey>) {
    match root {
        Some(key) => out.extend_from_slice(&key.encode()),
        None => out.extend_from_slice(&[0u8; BIP32_EXTKEY_SIZE]),
    }
}

fn read_opt_root(reader: &mut Reader) -> Result<Option<ExtendedPubKey>, DecodeError> {
    let raw = reader.take(BIP32_EXTKEY_SIZE)?;
    if raw.iter().all(|&b| b == 0) {
        return Ok(None);
    }
    let mut buf = [0u8; BIP32_EXTKEY_SIZE];
    buf.copy_from_slice(raw);
    ExtendedPubKey::decode(&buf)
        .map(Some)
        .map_err(|_| DecodeError::InvalidPubKey)
}

fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    if n <= 0xfc {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.data.len() - self.pos < n {
            return Err(DecodeError::UnexpectedEnd);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32_le(&mut self) -> Result<u32, DecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn i32_le(&mut self) -> Result<i32, DecodeError> {
        let raw = self.take(4)?;
        Ok(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn i64_le(&mut self) -> Result<i64, DecodeError> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(i64::from_le_bytes(buf))
    }

    fn compact_size(&mut self) -> Result<u64, DecodeError> {
        let tag = self.u8()?;
        let value = match tag {
            0xfd => {
                let raw = self.take(2)?;
                u16::from_le_bytes([raw[0], raw[1]]) as u64
            }
            0xfe => self.u32_le()? as u64,
            0xff => {
                let raw = self.take(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(raw);
                u64::from_le_bytes(buf)
            }
            n => n as u64,
        };
        Ok(value)
    }

    /// A compact-size prefixed byte field.
    fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.compact_size()?;
        if len > MAX_FIELD_SIZE {
            return Err(DecodeError::OversizedField(len));
        }
        self.take(len as usize)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let raw = self.bytes()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidString)
    }

    fn finish(self) -> Result<(), DecodeError> {
        if self.pos != self.data.len() {
            return Err(DecodeError::TrailingData);
        }
        Ok(())
    }
}
