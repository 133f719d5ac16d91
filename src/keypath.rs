use std::fmt;

/// Child indices at or above this value are hardened.
pub const HARDENED_BIT: u32 = 0x80000000;

/// Hard cap on path length, bounding derivation work per call.
pub const MAX_PATH_DEPTH: usize = 255;

#[derive(Debug, PartialEq, Eq)]
pub enum KeyPathError {
    MissingMaster,
    MisplacedMaster,
    InvalidSegment(String),
    UnresolvedChainSwitch,
    TooDeep(usize),
}

impl fmt::Display for KeyPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPathError::MissingMaster => write!(f, "keypath must start with 'm'"),
            KeyPathError::MisplacedMaster => write!(f, "'m' is only valid as the first segment"),
            KeyPathError::InvalidSegment(s) => write!(f, "invalid keypath segment '{}'", s),
            KeyPathError::UnresolvedChainSwitch => {
                write!(f, "chain switch 'c' must be materialized before derivation")
            }
            KeyPathError::TooDeep(n) => write!(f, "keypath has {} segments, limit is {}", n, MAX_PATH_DEPTH),
        }
    }
}

impl std::error::Error for KeyPathError {}

/// One step of a keypath. `ChainSwitch` is the template placeholder that
/// selects the external (0) or internal (1) subtree at derivation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSegment {
    Master,
    Child { index: u32, hardened: bool },
    ChainSwitch,
}

/// A parsed keypath such as `m/44'/0'/0'/c/3`. The string form is kept
/// only inside the stored records; everything that walks a path works on
/// the segment list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    segments: Vec<PathSegment>,
}

impl KeyPath {
    pub fn from_str(path: &str) -> Result<Self, KeyPathError> {
        let mut segments = Vec::new();
        for (pos, fragment) in path.split('/').enumerate() {
            if pos == 0 {
                if fragment != "m" {
                    return Err(KeyPathError::MissingMaster);
                }
                segments.push(PathSegment::Master);
                continue;
            }
            segments.push(match fragment {
                "m" => return Err(KeyPathError::MisplacedMaster),
                "c" => PathSegment::ChainSwitch,
                _ => {
                    let (digits, hardened) = match fragment.strip_suffix('\'') {
                        Some(d) => (d, true),
                        None => (fragment, false),
                    };
                    // signed parse keeps every index below 2^31
                    let index = digits
                        .parse::<i32>()
                        .map_err(|_| KeyPathError::InvalidSegment(fragment.to_string()))?;
                    if index < 0 {
                        return Err(KeyPathError::InvalidSegment(fragment.to_string()));
                    }
                    PathSegment::Child {
                        index: index as u32,
                        hardened,
                    }
                }
            });
        }
        if segments.len() > MAX_PATH_DEPTH {
            return Err(KeyPathError::TooDeep(segments.len()));
        }
        Ok(KeyPath { segments })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn is_materialized(&self) -> bool {
        !self
            .segments
            .iter()
            .any(|s| matches!(s, PathSegment::ChainSwitch))
    }

    /// Replaces every chain-switch segment with the external (0) or
    /// internal (1) child index.
    pub fn materialize(&self, internal: bool) -> KeyPath {
        let index = internal as u32;
        let segments = self
            .segments
            .iter()
            .map(|s| match s {
                PathSegment::ChainSwitch => PathSegment::Child {
                    index,
                    hardened: false,
                },
                other => *other,
            })
            .collect();
        KeyPath { segments }
    }

    /// Returns a copy of self with one more child segment appended.
    pub fn with_child(&self, index: u32, hardened: bool) -> KeyPath {
        let mut segments = self.segments.clone();
        segments.push(PathSegment::Child { index, hardened });
        KeyPath { segments }
    }

    /// Flattens a materialized path into raw BIP32 child indices with the
    /// hardened bit folded in. The leading master segment is skipped; an
    /// unresolved chain switch is rejected.
    pub fn derivation_indices(&self) -> Result<Vec<u32>, KeyPathError> {
        let mut indices = Vec::with_capacity(self.segments.len().saturating_sub(1));
        for (pos, segment) in self.segments.iter().enumerate() {
            match segment {
                PathSegment::Master if pos == 0 => {}
                PathSegment::Master => return Err(KeyPathError::MisplacedMaster),
                PathSegment::ChainSwitch => return Err(KeyPathError::UnresolvedChainSwitch),
                PathSegment::Child { index, hardened } => {
                    indices.push(if *hardened { HARDENED_BIT | index } else { *index });
                }
            }
        }
        Ok(indices)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pos, segment) in self.segments.iter().enumerate() {
            if pos > 0 {
                write!(f, "/")?;
            }
            match segment {
                PathSegment::Master => write!(f, "m")?,
                PathSegment::ChainSwitch => write!(f, "c")?,
                PathSegment::Child {
                    index,
                    hardened: true,
                } => write!(f, "{}'", index)?,
                PathSegment::Child {
                    index,
                    hardened: false,
                } => write!(f, "{}", index)?,
            }
        }
        Ok(())
    }
}
