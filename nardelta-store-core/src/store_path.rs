use std::fmt;

use thiserror::Error;

use crate::base32;
use crate::{STORE_DIR, STORE_HASH_LEN};

#[derive(Error, Debug)]
pub enum StorePathError {
    #[error("path is not inside {STORE_DIR}: {0}")]
    NotInStore(String),

    #[error("store name has no dash separator: {0}")]
    MissingDash(String),

    #[error("bad store hash {hash:?}: {reason}")]
    BadHash { hash: String, reason: String },
}

/// A full absolute store path, e.g.
/// `/nix/store/<32-char-hash>-pipewire-0.3.71`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath {
    path: String,
}

impl StorePath {
    pub fn from_parts(hash: &str, rest: &str) -> Self {
        Self {
            path: format!("{STORE_DIR}/{hash}-{rest}"),
        }
    }

    pub fn parse(path: &str) -> Result<Self, StorePathError> {
        // validate by splitting the name
        StoreName::parse(
            path.strip_prefix(STORE_DIR)
                .and_then(|p| p.strip_prefix('/'))
                .ok_or_else(|| StorePathError::NotInStore(path.into()))?,
        )?;
        Ok(Self { path: path.into() })
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// The `hash-rest` part, without the store directory.
    pub fn name(&self) -> StoreName<'_> {
        let name = &self.path[STORE_DIR.len() + 1..];
        StoreName::parse(name).expect("validated on construction")
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// A parsed store name: the 32-character base32 hash and the
/// human-readable remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreName<'a> {
    pub hash: &'a str,
    pub rest: &'a str,
}

impl<'a> StoreName<'a> {
    /// Split `hash-rest`. The hash must be exactly 32 valid base32
    /// characters; the rest may be any non-empty suffix.
    pub fn parse(name: &'a str) -> Result<Self, StorePathError> {
        let (hash, rest) = name
            .split_once('-')
            .ok_or_else(|| StorePathError::MissingDash(name.into()))?;
        if hash.len() != STORE_HASH_LEN {
            return Err(StorePathError::BadHash {
                hash: hash.into(),
                reason: format!("expected {STORE_HASH_LEN} characters, got {}", hash.len()),
            });
        }
        Ok(Self { hash, rest })
    }

    /// Decode the hash part to its 20-byte digest.
    pub fn hash_bytes(&self) -> Result<[u8; 20], StorePathError> {
        let decoded = base32::from_base32(self.hash).map_err(|reason| StorePathError::BadHash {
            hash: self.hash.into(),
            reason,
        })?;
        decoded
            .try_into()
            .map_err(|v: Vec<u8>| StorePathError::BadHash {
                hash: self.hash.into(),
                reason: format!("decoded to {} bytes, expected 20", v.len()),
            })
    }
}

impl fmt::Display for StoreName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.hash, self.rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c";

    #[test]
    fn test_parse_store_path() {
        let p = StorePath::parse(&format!("/nix/store/{HASH}-rsync-3.2.6")).unwrap();
        let name = p.name();
        assert_eq!(name.hash, HASH);
        assert_eq!(name.rest, "rsync-3.2.6");
    }

    #[test]
    fn test_parse_rejects_outside_store() {
        assert!(StorePath::parse("/tmp/whatever").is_err());
    }

    #[test]
    fn test_name_hash_roundtrip() {
        let full = format!("{HASH}-linux-6.1.55");
        let name = StoreName::parse(&full).unwrap();
        let bytes = name.hash_bytes().unwrap();
        assert_eq!(base32::to_base32(&bytes), HASH);
    }

    #[test]
    fn test_rejects_short_hash() {
        assert!(StoreName::parse("abc-foo").is_err());
    }
}
