use std::fmt::{Debug, Display};

use serde::de::Visitor;
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// One step of a document path: an array index or an object key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathIndex {
    Int(u32),
    Key(String),
}

impl PathIndex {
    #[inline]
    pub fn key(s: impl Into<String>) -> Self {
        PathIndex::Key(s.into())
    }
}

impl From<u32> for PathIndex {
    fn from(i: u32) -> Self {
        PathIndex::Int(i)
    }
}

impl From<&str> for PathIndex {
    fn from(s: &str) -> Self {
        PathIndex::Key(s.to_string())
    }
}

impl From<String> for PathIndex {
    fn from(s: String) -> Self {
        PathIndex::Key(s)
    }
}

// Lead bytes of the length-prefixed encoding. The variants never prefix one
// another, so decoding is a single forward pass and a byte-wise prefix of an
// encoded path is always segment-aligned.
const FIXSTR: u8 = 0xA0; // 0xA0..=0xBF: string, length in the low 5 bits
const UINT8: u8 = 0xCC;
const UINT16: u8 = 0xCD;
const UINT32: u8 = 0xCE;
const STR8: u8 = 0xD9;
const STR16: u8 = 0xDA;
const STR32: u8 = 0xDB;

/// A document location encoded as a byte string, one length-prefixed segment
/// per [PathIndex]. The empty path is the document root.
///
/// Paths order by unsigned byte comparison. That order is *not* numeric for
/// array indices (index 10 sorts before index 2 in some width mixes), which
/// is fine because array traversal always goes through the parent marker's
/// `len`, never through map order.
#[derive(Default, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BinaryPath(Vec<u8>);

impl BinaryPath {
    pub const ROOT: BinaryPath = BinaryPath(Vec::new());

    pub fn encode<'a>(indices: impl IntoIterator<Item = &'a PathIndex>) -> Self {
        let mut path = BinaryPath::ROOT;
        for index in indices {
            path.push(index);
        }
        path
    }

    #[inline]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        BinaryPath(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, index: &PathIndex) {
        match index {
            PathIndex::Int(i) => match *i {
                0..=0x7F => self.0.push(*i as u8),
                0x80..=0xFF => {
                    self.0.push(UINT8);
                    self.0.push(*i as u8);
                }
                0x100..=0xFFFF => {
                    self.0.push(UINT16);
                    self.0.extend_from_slice(&(*i as u16).to_be_bytes());
                }
                _ => {
                    self.0.push(UINT32);
                    self.0.extend_from_slice(&i.to_be_bytes());
                }
            },
            PathIndex::Key(s) => {
                let bytes = s.as_bytes();
                match bytes.len() {
                    0..=31 => self.0.push(FIXSTR | bytes.len() as u8),
                    32..=0xFF => {
                        self.0.push(STR8);
                        self.0.push(bytes.len() as u8);
                    }
                    0x100..=0xFFFF => {
                        self.0.push(STR16);
                        self.0.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                    }
                    _ => {
                        self.0.push(STR32);
                        self.0.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                    }
                }
                self.0.extend_from_slice(bytes);
            }
        }
    }

    pub fn append(&self, index: impl Into<PathIndex>) -> Self {
        let mut child = self.clone();
        child.push(&index.into());
        child
    }

    pub fn concat(&self, suffix: &BinaryPath) -> Self {
        let mut out = self.clone();
        out.0.extend_from_slice(&suffix.0);
        out
    }

    pub fn decode(&self) -> Result<Vec<PathIndex>, StoreError> {
        self.iter().collect()
    }

    pub fn iter(&self) -> PathIter<'_> {
        PathIter { bytes: &self.0 }
    }

    /// Number of segments. O(n) over the encoding.
    pub fn depth(&self) -> usize {
        self.iter().count()
    }

    /// Splits off the last segment. Returns `None` at the root.
    pub fn split(&self) -> Result<Option<(BinaryPath, PathIndex)>, StoreError> {
        if self.is_root() {
            return Ok(None);
        }
        let mut last_start = 0;
        let mut iter = PathIter { bytes: &self.0 };
        let mut last = None;
        loop {
            let remaining = iter.bytes.len();
            match iter.next() {
                Some(Ok(index)) => {
                    last_start = self.0.len() - remaining;
                    last = Some(index);
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        let parent = BinaryPath(self.0[..last_start].to_vec());
        Ok(last.map(|index| (parent, index)))
    }

    pub fn parent(&self) -> Result<Option<BinaryPath>, StoreError> {
        Ok(self.split()?.map(|(parent, _)| parent))
    }

    /// Segment-aligned prefix test; valid because no lead byte ambiguously
    /// prefixes another segment's encoding.
    #[inline]
    pub fn starts_with(&self, prefix: &BinaryPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn strip_prefix(&self, prefix: &BinaryPath) -> Option<BinaryPath> {
        self.0
            .strip_prefix(prefix.0.as_slice())
            .map(|rest| BinaryPath(rest.to_vec()))
    }

    /// Smallest byte string greater than every descendant of this path, for
    /// use as an exclusive range end. `None` means unbounded.
    pub fn subtree_end(&self) -> Option<BinaryPath> {
        let mut bytes = self.0.clone();
        while let Some(last) = bytes.last_mut() {
            if *last < 0xFF {
                *last += 1;
                return Some(BinaryPath(bytes));
            }
            bytes.pop();
        }
        None
    }
}

pub struct PathIter<'a> {
    bytes: &'a [u8],
}

impl Iterator for PathIter<'_> {
    type Item = Result<PathIndex, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&lead, rest) = self.bytes.split_first()?;
        let result = match lead {
            0x00..=0x7F => {
                self.bytes = rest;
                Ok(PathIndex::Int(lead as u32))
            }
            UINT8 => self.take_int(rest, 1),
            UINT16 => self.take_int(rest, 2),
            UINT32 => self.take_int(rest, 4),
            0xA0..=0xBF => self.take_str(rest, (lead & 0x1F) as usize),
            STR8 => self.take_sized_str(rest, 1),
            STR16 => self.take_sized_str(rest, 2),
            STR32 => self.take_sized_str(rest, 4),
            _ => Err(StoreError::MalformedPath),
        };
        if result.is_err() {
            // Poison the iterator so a malformed tail yields one error.
            self.bytes = &[];
        }
        Some(result)
    }
}

impl PathIter<'_> {
    fn take_int(&mut self, rest: &'_ [u8], width: usize) -> Result<PathIndex, StoreError> {
        if rest.len() < width {
            return Err(StoreError::MalformedPath);
        }
        let mut value = 0u32;
        for &b in &rest[..width] {
            value = (value << 8) | b as u32;
        }
        self.advance(rest, width);
        Ok(PathIndex::Int(value))
    }

    fn take_sized_str(&mut self, rest: &'_ [u8], width: usize) -> Result<PathIndex, StoreError> {
        if rest.len() < width {
            return Err(StoreError::MalformedPath);
        }
        let mut len = 0usize;
        for &b in &rest[..width] {
            len = (len << 8) | b as usize;
        }
        self.take_str(&rest[width..], len)
    }

    fn take_str(&mut self, rest: &'_ [u8], len: usize) -> Result<PathIndex, StoreError> {
        if rest.len() < len {
            return Err(StoreError::MalformedPath);
        }
        let s = std::str::from_utf8(&rest[..len]).map_err(|_| StoreError::MalformedPath)?;
        let index = PathIndex::Key(s.to_string());
        self.advance(rest, len);
        Ok(index)
    }

    fn advance(&mut self, rest: &'_ [u8], consumed: usize) {
        let total = self.bytes.len() - rest.len() + consumed;
        self.bytes = &self.bytes[total..];
    }
}

impl Display for BinaryPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("$")?;
        for index in self.iter() {
            match index {
                Ok(PathIndex::Int(i)) => write!(f, "[{}]", i)?,
                Ok(PathIndex::Key(k)) => {
                    let plain = !k.is_empty()
                        && k.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_')
                        && k.chars().all(|c| c.is_alphanumeric() || c == '_');
                    if plain {
                        write!(f, ".{}", k)?;
                    } else {
                        write!(f, "[{:?}]", k)?;
                    }
                }
                Err(_) => return write!(f, "<malformed:{}>", hex::encode(&self.0)),
            }
        }
        Ok(())
    }
}

impl Debug for BinaryPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl<I: Into<PathIndex>> FromIterator<I> for BinaryPath {
    fn from_iter<T: IntoIterator<Item = I>>(iter: T) -> Self {
        let mut path = BinaryPath::ROOT;
        for index in iter {
            path.push(&index.into());
        }
        path
    }
}

// Serialized as raw bytes so msgpack stores the encoding verbatim.
impl Serialize for BinaryPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for BinaryPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BytesVisitor;
        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = BinaryPath;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a byte string")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(BinaryPath(v.to_vec()))
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(BinaryPath(v))
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Self::Value, A::Error> {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                Ok(BinaryPath(bytes))
            }
        }
        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn path(indices: &[PathIndex]) -> BinaryPath {
        BinaryPath::encode(indices)
    }

    #[test]
    fn encoding_table() {
        assert_eq!(path(&[PathIndex::Int(0)]).as_bytes(), &[0x00]);
        assert_eq!(path(&[PathIndex::Int(127)]).as_bytes(), &[0x7F]);
        assert_eq!(path(&[PathIndex::Int(128)]).as_bytes(), &[0xCC, 0x80]);
        assert_eq!(path(&[PathIndex::Int(256)]).as_bytes(), &[0xCD, 0x01, 0x00]);
        assert_eq!(
            path(&[PathIndex::Int(0x1_0000)]).as_bytes(),
            &[0xCE, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(path(&[PathIndex::key("")]).as_bytes(), &[0xA0]);
        assert_eq!(path(&[PathIndex::key("ab")]).as_bytes(), &[0xA2, b'a', b'b']);
        let long = "x".repeat(32);
        let encoded = path(&[PathIndex::key(&long)]);
        assert_eq!(encoded.as_bytes()[0], 0xD9);
        assert_eq!(encoded.as_bytes()[1], 32);
    }

    #[test]
    fn split_and_parent() {
        let p = path(&[PathIndex::key("foo"), PathIndex::Int(3)]);
        let (parent, last) = p.split().unwrap().unwrap();
        assert_eq!(parent, path(&[PathIndex::key("foo")]));
        assert_eq!(last, PathIndex::Int(3));
        assert_eq!(BinaryPath::ROOT.split().unwrap(), None);
    }

    #[test]
    fn subtree_prefix() {
        let p = path(&[PathIndex::key("foo")]);
        let child = p.append(2u32);
        assert!(child.starts_with(&p));
        assert!(!p.starts_with(&child));
        let end = p.subtree_end().unwrap();
        assert!(child < end);
        assert!(p < end);
    }

    #[test]
    fn byte_order_is_not_numeric() {
        // 2 encodes as 0x02, 200 as 0xCC 0xC8: byte order puts 2 first here,
        // but 128 (0xCC 0x80) sorts after 127 (0x7F) only by lead byte.
        let two = path(&[PathIndex::Int(2)]);
        let ten = path(&[PathIndex::Int(10)]);
        let big = path(&[PathIndex::Int(200)]);
        assert!(two < ten);
        assert!(ten < big);
    }

    #[test]
    fn malformed_rejected() {
        assert!(BinaryPath::from_bytes(vec![0xC1]).decode().is_err());
        assert!(BinaryPath::from_bytes(vec![0xCC]).decode().is_err());
        assert!(BinaryPath::from_bytes(vec![0xA3, b'a']).decode().is_err());
    }

    proptest! {
        #[test]
        fn round_trip(indices in prop::collection::vec(
            prop_oneof![
                any::<u32>().prop_map(PathIndex::Int),
                ".{0,40}".prop_map(PathIndex::Key),
            ],
            0..8,
        )) {
            let encoded = BinaryPath::encode(&indices);
            prop_assert_eq!(encoded.decode().unwrap(), indices);
        }

        #[test]
        fn append_matches_encode(
            head in prop::collection::vec(any::<u32>().prop_map(PathIndex::Int), 0..4),
            last in any::<u32>(),
        ) {
            let mut all = head.clone();
            all.push(PathIndex::Int(last));
            let appended = BinaryPath::encode(&head).append(last);
            prop_assert_eq!(appended, BinaryPath::encode(&all));
        }
    }
}
