//! Embedded ordered key-value layer.
//!
//! `Column` names the five logical sub-databases of the engine. A store
//! opened at a directory hosts a subset of them; the database multiplexer
//! above decides which columns live in which directory per deployment
//! mode.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
    MissingColumn(Column),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
            StoreError::MissingColumn(column) => {
                write!(f, "column {} not hosted by this store", column.as_str())
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// The five logical sub-databases.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    Headers,
    Blkdata,
    History,
    Txhints,
    Spentness,
}

impl Column {
    pub const ALL: [Column; 5] = [
        Column::Headers,
        Column::Blkdata,
        Column::History,
        Column::Txhints,
        Column::Spentness,
    ];

    pub const fn index(self) -> usize {
        match self {
            Column::Headers => 0,
            Column::Blkdata => 1,
            Column::History => 2,
            Column::Txhints => 3,
            Column::Spentness => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Headers => "headers",
            Column::Blkdata => "blkdata",
            Column::History => "history",
            Column::Txhints => "txhints",
            Column::Spentness => "spentness",
        }
    }
}

#[derive(Clone, Debug)]
pub struct WriteKey(SmallVec<[u8; 40]>);

impl WriteKey {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl AsRef<[u8]> for WriteKey {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteKey {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteKey {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteKey {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteKey {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub struct WriteValue(SmallVec<[u8; 64]>);

impl WriteValue {
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0.into_vec()
    }
}

impl AsRef<[u8]> for WriteValue {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for WriteValue {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for WriteValue {
    fn from(value: &[u8]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

impl<const N: usize> From<[u8; N]> for WriteValue {
    fn from(value: [u8; N]) -> Self {
        Self(SmallVec::from_slice(&value))
    }
}

impl<const N: usize> From<&[u8; N]> for WriteValue {
    fn from(value: &[u8; N]) -> Self {
        Self(SmallVec::from_slice(value))
    }
}

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

/// An atomic unit of mutation. Built up by the write side, committed
/// exactly once; consumption on commit is what rules out partial commits.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.ops.reserve(additional);
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    /// Read-your-writes point lookup: the most recent pending operation on
    /// `key`, if any. `Some(None)` means the key is pending deletion.
    pub fn pending_get(&self, column: Column, key: &[u8]) -> Option<Option<&[u8]>> {
        for op in self.ops.iter().rev() {
            match op {
                WriteOp::Put {
                    column: op_column,
                    key: op_key,
                    value,
                } if *op_column == column && op_key.as_slice() == key => {
                    return Some(Some(value.as_slice()));
                }
                WriteOp::Delete {
                    column: op_column,
                    key: op_key,
                } if *op_column == column && op_key.as_slice() == key => {
                    return Some(None);
                }
                _ => {}
            }
        }
        None
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

/// Owned cursor stream. Entries reflect the store as of creation; writes
/// issued afterwards are not observed.
pub type StoreIter = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), StoreError>> + Send>;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    /// Ascending from the smallest key >= `start`.
    fn iter_from(&self, column: Column, start: &[u8]) -> Result<StoreIter, StoreError>;
    /// Descending from the largest key <= `start`.
    fn iter_rev_from(&self, column: Column, start: &[u8]) -> Result<StoreIter, StoreError>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.as_ref().delete(column, key)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.as_ref().for_each_prefix(column, prefix, visitor)
    }

    fn iter_from(&self, column: Column, start: &[u8]) -> Result<StoreIter, StoreError> {
        self.as_ref().iter_from(column, start)
    }

    fn iter_rev_from(&self, column: Column, start: &[u8]) -> Result<StoreIter, StoreError> {
        self.as_ref().iter_rev_from(column, start)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }
}

/// Backend dispatch, so callers can pick the on-disk store or the
/// in-memory one at open time.
pub enum Store {
    Memory(memory::MemoryStore),
    #[cfg(feature = "fjall")]
    Fjall(fjall::FjallStore),
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            #[cfg(feature = "fjall")]
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            #[cfg(feature = "fjall")]
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            #[cfg(feature = "fjall")]
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            #[cfg(feature = "fjall")]
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            #[cfg(feature = "fjall")]
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn iter_from(&self, column: Column, start: &[u8]) -> Result<StoreIter, StoreError> {
        match self {
            Store::Memory(store) => store.iter_from(column, start),
            #[cfg(feature = "fjall")]
            Store::Fjall(store) => store.iter_from(column, start),
        }
    }

    fn iter_rev_from(&self, column: Column, start: &[u8]) -> Result<StoreIter, StoreError> {
        match self {
            Store::Memory(store) => store.iter_rev_from(column, start),
            #[cfg(feature = "fjall")]
            Store::Fjall(store) => store.iter_rev_from(column, start),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            #[cfg(feature = "fjall")]
            Store::Fjall(store) => store.write_batch(batch),
        }
    }
}
