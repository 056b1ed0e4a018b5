//! # Data Entity
//!
//! Purpose: the tagged variant stored in a database's data dict. Type
//! checks happen here so every command executor gets a `WrongType` error
//! before it ever touches the underlying value.

use hkv_common::{HkvError, HkvResult};

use crate::sortedset::SortedSet;

/// A value the sharded map can hold: a byte string or a sorted set.
#[derive(Debug, Clone)]
pub enum DataEntity {
    Bytes(Vec<u8>),
    SortedSet(SortedSet),
}

impl DataEntity {
    pub fn as_bytes(&self) -> HkvResult<&[u8]> {
        match self {
            DataEntity::Bytes(b) => Ok(b),
            DataEntity::SortedSet(_) => Err(HkvError::WrongType),
        }
    }

    pub fn as_sorted_set(&self) -> HkvResult<&SortedSet> {
        match self {
            DataEntity::SortedSet(s) => Ok(s),
            DataEntity::Bytes(_) => Err(HkvError::WrongType),
        }
    }

    pub fn as_sorted_set_mut(&mut self) -> HkvResult<&mut SortedSet> {
        match self {
            DataEntity::SortedSet(s) => Ok(s),
            DataEntity::Bytes(_) => Err(HkvError::WrongType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_type_is_reported_both_ways() {
        let bytes = DataEntity::Bytes(b"v".to_vec());
        assert!(bytes.as_sorted_set().is_err());
        let zset = DataEntity::SortedSet(SortedSet::new());
        assert!(zset.as_bytes().is_err());
    }
}
