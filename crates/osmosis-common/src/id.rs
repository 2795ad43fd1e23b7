use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::StoreError;

/// Identifies the peer that authored an op. A peer mints its id once (on
/// first run) and reuses it for every subsequent session.
pub type AuthorId = Uuid;

/// Globally unique name of an op in the log: the authoring peer plus that
/// peer's op index. Indices grow monotonically per author but are not
/// necessarily contiguous (a transaction consumes one index per sub-action).
#[derive(PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct Id {
    pub author: AuthorId,
    pub index: u64,
}

impl Id {
    /// Sentinel root of the log. Orders before every real op id.
    pub const ZERO: Id = Id {
        author: Uuid::nil(),
        index: 0,
    };

    #[inline]
    pub const fn new(author: AuthorId, index: u64) -> Self {
        Id { author, index }
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// 16 author bytes followed by the index as big-endian u64. This layout
    /// feeds the rolling state hash and save-point file names, so it must
    /// stay byte-stable across peers.
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut buf = [0u8; 24];
        buf[..16].copy_from_slice(self.author.as_bytes());
        buf[16..].copy_from_slice(&self.index.to_be_bytes());
        buf
    }

    #[inline]
    pub fn inc(&self, inc: u64) -> Self {
        Id {
            author: self.author,
            index: self.index + inc,
        }
    }
}

impl PartialOrd for Id {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Id {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.author.as_bytes().cmp(other.author.as_bytes()) {
            core::cmp::Ordering::Equal => self.index.cmp(&other.index),
            ord => ord,
        }
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(format!("{}@{}", self.index, self.author.simple()).as_str())
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(format!("{}@{}", self.index, self.author.simple()).as_str())
    }
}

impl TryFrom<&str> for Id {
    type Error = StoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut iter = value.split('@');
        let (Some(index), Some(author), None) = (iter.next(), iter.next(), iter.next()) else {
            return Err(StoreError::Decode("invalid id format".into()));
        };
        let index = index
            .parse::<u64>()
            .map_err(|_| StoreError::Decode("invalid id index".into()))?;
        let author = Uuid::parse_str(author)
            .map_err(|_| StoreError::Decode("invalid id author".into()))?;
        Ok(Id { author, index })
    }
}
