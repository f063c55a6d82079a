use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use bytes::Bytes;
use futures_core::Stream;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::CasError;

/// Stream of bytes for object content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// A content identifier the store can key objects by.
///
/// The store only ever looks at the canonical string form produced by
/// `Display`; two identifiers with the same rendering address the same object.
pub trait ContentId: fmt::Display + Send + Sync {
    /// Canonical string form used to build object keys
    fn canonical(&self) -> String {
        self.to_string()
    }
}

impl<T: fmt::Display + Send + Sync + ?Sized> ContentId for T {}

/// BLAKE3 digest of an object's bytes.
///
/// Canonical form is 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Identify a payload
    pub fn identify(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create from a pre-computed hash
    pub fn from_hash(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// Parse the canonical hex form
    pub fn from_hex(s: &str) -> Result<Self, CasError> {
        let bytes = hex::decode(s).map_err(|e| CasError::invalid(format!("invalid digest {:?}: {}", s, e)))?;
        let hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CasError::invalid(format!("digest {:?} is not 32 bytes", s)))?;
        Ok(Self(hash))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", &self.to_hex()[..8])
    }
}

impl FromStr for ContentDigest {
    type Err = CasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Builds backend object keys from identifiers.
///
/// Every operation goes through [`KeyLayout::object_key`], so Create, Open and
/// Remove always agree on where an identifier lives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    /// Clean `prefix` into `/`-separated segments: empty and `.` segments
    /// are dropped and `..` removes the segment before it.
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        let prefix = prefix.into();
        let mut segments: Vec<&str> = Vec::new();
        for segment in prefix.split('/') {
            match segment {
                "" | "." => {}
                ".." if segments.last().is_some_and(|last| *last != "..") => {
                    segments.pop();
                }
                _ => segments.push(segment),
            }
        }
        // a prefix of only slashes means "root", same as none
        Self {
            prefix: segments.join("/"),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `prefix/canonical`, or the canonical string alone without a prefix
    pub fn object_key<I: ContentId + ?Sized>(&self, id: &I) -> String {
        let canonical = id.canonical();
        if self.prefix.is_empty() {
            canonical
        } else {
            format!("{}/{}", self.prefix, canonical)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_is_deterministic() {
        assert_eq!(ContentDigest::identify(b"foobar"), ContentDigest::identify(b"foobar"));
        assert_ne!(ContentDigest::identify(b"foobar"), ContentDigest::identify(b"foobaz"));
    }

    #[test]
    fn hex_form_parses_back() {
        let id = ContentDigest::identify(b"foobar");
        let parsed: ContentDigest = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_string().len(), 64);
    }

    #[test]
    fn bad_hex_is_rejected() {
        assert!(ContentDigest::from_hex("zz").is_err());
        assert!(ContentDigest::from_hex("abcd").is_err());
    }

    #[test]
    fn key_layout_joins_with_single_slash() {
        let id = ContentDigest::identify(b"x");
        assert_eq!(KeyLayout::new("store_test").object_key(&id), format!("store_test/{}", id));
        assert_eq!(KeyLayout::new("store_test/").object_key(&id), format!("store_test/{}", id));
        assert_eq!(KeyLayout::new("a/b").object_key(&id), format!("a/b/{}", id));
    }

    #[test]
    fn key_layout_cleans_the_prefix() {
        let id = ContentDigest::identify(b"x");
        assert_eq!(KeyLayout::new("a//b").object_key(&id), format!("a/b/{}", id));
        assert_eq!(KeyLayout::new("/a/./b//").object_key(&id), format!("a/b/{}", id));
        assert_eq!(KeyLayout::new("a/c/../b").prefix(), "a/b");
        assert_eq!(KeyLayout::new("..").prefix(), "..");
    }

    #[test]
    fn empty_prefix_uses_bare_canonical_form() {
        let id = ContentDigest::identify(b"x");
        assert_eq!(KeyLayout::new("").object_key(&id), id.to_string());
        assert_eq!(KeyLayout::new("/").object_key(&id), id.to_string());
        assert_eq!(KeyLayout::default().object_key("plain-id"), "plain-id");
    }
}
