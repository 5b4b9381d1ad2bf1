//! Keys, values and digests.
//!
//! A store key is a user key rendered into a namespaced string:
//! `{prefix:08x}|{user}` for the new namespace and `{prefix:08x}|old_{user}`
//! for the old one. The arena itself is keyed by the 16-byte MD5 digest of
//! that string, so new and old bindings of the same user key live in
//! disjoint digest spaces inside the same region. The `old_` token is
//! reserved: user keys whose rendering starts with it are rejected at
//! construction.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errdata;
use crate::error::Result;

/// The reserved discriminator between the new and old namespaces.
const OLD_TOKEN: &str = "old_";

/// A numeric key namespace. Each value type owns one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix(pub u32);

/// Trait for user key types: a stable string rendering fed into the digest.
pub trait Key {
    /// Render the key. Two keys with equal renderings are the same key.
    fn encode(&self) -> String;
}

impl Key for String {
    fn encode(&self) -> String {
        self.clone()
    }
}

impl Key for &str {
    fn encode(&self) -> String {
        (*self).to_string()
    }
}

impl Key for u64 {
    fn encode(&self) -> String {
        self.to_string()
    }
}

impl Key for i64 {
    fn encode(&self) -> String {
        self.to_string()
    }
}

/// Trait for stored value types. Values are serialized with bincode and
/// stored opaquely; the description names this type in telemetry and the
/// prefix namespaces its keys.
pub trait Value: Serialize + DeserializeOwned {
    fn prefix() -> Prefix;
    fn description() -> &'static str;
}

/// An opaque, namespaced store key, either new- or old-flavored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey(String);

impl StoreKey {
    /// Builds a new-flavored key. Rejects user keys that begin with the
    /// reserved `old_` token.
    pub fn make<K: Key>(prefix: Prefix, key: &K) -> Result<StoreKey> {
        let user = key.encode();
        if user.starts_with(OLD_TOKEN) {
            return errdata!("user key {user:?} starts with the reserved old token");
        }
        Ok(StoreKey(format!("{:08x}|{user}", prefix.0)))
    }

    /// Builds an old-flavored key directly.
    pub fn make_old<K: Key>(prefix: Prefix, key: &K) -> Result<StoreKey> {
        Ok(Self::make(prefix, key)?.to_old())
    }

    /// Converts a new key to its old twin.
    pub fn to_old(&self) -> StoreKey {
        debug_assert!(!self.is_old());
        let (ns, user) = self.split();
        StoreKey(format!("{ns}|{OLD_TOKEN}{user}"))
    }

    /// Recovers the new key an old key was made from.
    pub fn new_from_old(&self) -> StoreKey {
        debug_assert!(self.is_old());
        let (ns, user) = self.split();
        StoreKey(format!("{ns}|{}", &user[OLD_TOKEN.len()..]))
    }

    pub fn is_old(&self) -> bool {
        self.split().1.starts_with(OLD_TOKEN)
    }

    /// The arena digest of this key.
    pub fn md5(&self) -> Digest {
        Digest(md5::compute(self.0.as_bytes()).0)
    }

    /// The arena digest of this key's old twin.
    pub fn md5_old(&self) -> Digest {
        self.to_old().md5()
    }

    fn split(&self) -> (&str, &str) {
        // Constructors guarantee the separator.
        self.0.split_once('|').expect("store key has a namespace")
    }
}

/// The 16-byte MD5 digest keying the arena's hash table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; 16]);

impl Digest {
    /// Low 8 bytes as a little-endian word, as stored in a hash slot.
    pub fn lo(&self) -> u64 {
        u64::from_le_bytes(self.0[..8].try_into().unwrap())
    }

    /// High 8 bytes as a little-endian word.
    pub fn hi(&self) -> u64 {
        u64::from_le_bytes(self.0[8..].try_into().unwrap())
    }

    pub fn from_words(lo: u64, hi: u64) -> Digest {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&lo.to_le_bytes());
        bytes[8..].copy_from_slice(&hi.to_le_bytes());
        Digest(bytes)
    }

    /// The slot index this digest hashes to in a table of `2^pow` slots.
    pub fn slot(&self, pow: u8) -> usize {
        (self.lo() & ((1u64 << pow) - 1)) as usize
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: Prefix = Prefix(7);

    #[test]
    fn test_old_roundtrip() {
        let key = StoreKey::make(P, &"Foo\\Bar").unwrap();
        assert!(!key.is_old());
        let old = key.to_old();
        assert!(old.is_old());
        assert_eq!(old.new_from_old(), key);
    }

    #[test]
    fn test_make_old_matches_to_old() {
        let key = StoreKey::make(P, &"x").unwrap();
        let old = StoreKey::make_old(P, &"x").unwrap();
        assert_eq!(key.to_old(), old);
    }

    #[test]
    fn test_digest_spaces_disjoint() {
        for user in ["x", "old", "a|b", ""] {
            let key = StoreKey::make(P, &user).unwrap();
            assert_ne!(key.md5(), key.md5_old());
        }
    }

    #[test]
    fn test_reserved_token_rejected() {
        assert!(StoreKey::make(P, &"old_sneaky").is_err());
        // The token elsewhere in the key is fine.
        assert!(StoreKey::make(P, &"not_old_key").is_ok());
    }

    #[test]
    fn test_prefixes_separate_namespaces() {
        let a = StoreKey::make(Prefix(1), &"k").unwrap();
        let b = StoreKey::make(Prefix(2), &"k").unwrap();
        assert_ne!(a.md5(), b.md5());
    }

    #[test]
    fn test_digest_word_roundtrip() {
        let d = StoreKey::make(P, &"words").unwrap().md5();
        assert_eq!(Digest::from_words(d.lo(), d.hi()), d);
    }
}
