//! Record types returned by partition queries.
//!
//! Value encoding and digest hashing belong to the wire layer; these types
//! only carry what the query engine needs: a record's identity, the
//! partition it lives in, and its bins.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Length of a record digest in bytes
pub const DIGEST_SIZE: usize = 20;

/// Unique identifier of a record within a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_SIZE]);

impl Digest {
    pub fn new(bytes: [u8; DIGEST_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Partition owning this digest: the first two bytes, little endian,
    /// reduced to the partition space.
    pub fn partition_id(&self, partition_count: u16) -> u16 {
        let raw = u16::from_le_bytes([self.0[0], self.0[1]]);
        if partition_count == 0 {
            return 0;
        }
        raw % partition_count
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Bin value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Integer(i64),
    Float(f64),
    String(String),
    Blob(Bytes),
    List(Vec<Value>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Record identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    pub namespace: String,
    pub set_name: Option<String>,
    pub digest: Digest,
    /// User key, when the server stored it alongside the record
    pub user_key: Option<Value>,
}

impl Key {
    pub fn new(namespace: impl Into<String>, set_name: Option<String>, digest: Digest) -> Self {
        Self {
            namespace: namespace.into(),
            set_name,
            digest,
            user_key: None,
        }
    }
}

/// Record contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub bins: BTreeMap<String, Value>,
    pub generation: u32,
    /// Expiration in seconds since the server epoch (0 = never)
    pub expiration: u32,
}

impl Record {
    pub fn new(bins: BTreeMap<String, Value>) -> Self {
        Self {
            bins,
            ..Default::default()
        }
    }

    pub fn bin(&self, name: &str) -> Option<&Value> {
        self.bins.get(name)
    }
}

/// A record together with its key, as yielded by a record set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key: Key,
    pub record: Record,
}

impl KeyRecord {
    pub fn new(key: Key, record: Record) -> Self {
        Self { key, record }
    }

    pub fn digest(&self) -> &Digest {
        &self.key.digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_partition_id() {
        let mut bytes = [0u8; DIGEST_SIZE];
        bytes[0] = 0x01;
        bytes[1] = 0x10;
        let digest = Digest::new(bytes);
        assert_eq!(digest.partition_id(4096), 0x1001 % 4096);
        assert_eq!(digest.partition_id(6), 0x1001 % 6);
        assert_eq!(digest.partition_id(0), 0);
    }

    #[test]
    fn test_digest_display() {
        let digest = Digest::new([0xab; DIGEST_SIZE]);
        assert_eq!(digest.to_string(), "ab".repeat(DIGEST_SIZE));
    }

    #[test]
    fn test_record_bins() {
        let mut bins = BTreeMap::new();
        bins.insert("name".to_string(), Value::from("alice"));
        bins.insert("age".to_string(), Value::from(30));
        let record = Record::new(bins);
        assert_eq!(record.bin("age"), Some(&Value::Integer(30)));
        assert_eq!(record.bin("missing"), None);
    }
}
