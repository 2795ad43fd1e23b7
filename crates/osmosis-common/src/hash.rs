use std::fmt::{Debug, Display};

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};

use crate::Id;

type Blake2b256 = Blake2b<U32>;

/// Rolling commitment to the ordered op log. Two peers converged iff they
/// applied the same op set in the same canonical order, which makes the hash
/// a cheap equality check during sync.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct StateHash(pub [u8; 32]);

impl StateHash {
    /// Hash of the empty log.
    pub const ZERO: StateHash = StateHash([0u8; 32]);

    /// `H_{n+1} = BLAKE2b-256(H_n || author_bytes || index_be)`.
    pub fn advance(&self, id: Id) -> StateHash {
        let mut hasher = Blake2b256::new();
        hasher.update(self.0);
        hasher.update(id.to_bytes());
        StateHash(hasher.finalize().into())
    }
}

impl Debug for StateHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StateHash({})", hex::encode(self.0))
    }
}

impl Display for StateHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// File stem used by the flat-file backend for a save-point: 64 hex chars of
/// BLAKE2b-256 over the save-point id's binary form.
pub fn save_point_file_stem(id: Id) -> String {
    let mut hasher = Blake2b256::new();
    hasher.update(id.to_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn advance_depends_on_author_and_index() {
        let a = Uuid::from_bytes([1; 16]);
        let b = Uuid::from_bytes([2; 16]);
        let h0 = StateHash::ZERO;
        let h1 = h0.advance(Id::new(a, 1));
        assert_ne!(h1, h0);
        assert_ne!(h1, h0.advance(Id::new(a, 2)));
        assert_ne!(h1, h0.advance(Id::new(b, 1)));
        // Deterministic.
        assert_eq!(h1, StateHash::ZERO.advance(Id::new(a, 1)));
    }

    #[test]
    fn file_stem_is_hex64() {
        let stem = save_point_file_stem(Id::ZERO);
        assert_eq!(stem.len(), 64);
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(stem, save_point_file_stem(Id::new(Uuid::nil(), 1)));
    }
}
