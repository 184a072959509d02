//! Durable, indexed representation of the block chain and of per-script
//! transaction history, over an embedded ordered key-value store.

pub mod config;
pub mod db;
pub mod dbinfo;
pub mod header;
pub mod hints;
pub mod history;
pub mod iter;
pub mod schema;
pub mod tx;
pub mod undo;

pub use config::{Backend, DbConfig, DbMode, PruneMode};
pub use db::{BlockDb, DbError};
pub use dbinfo::{StoredDbInfo, NO_TOP_HEIGHT};
pub use header::{StoredHeadHgtList, StoredHeader};
pub use hints::StoredTxHints;
pub use history::{StoredScriptHistory, StoredSubHistory, TxioEntry, TxioKind};
pub use iter::DbIter;
pub use tx::{Spentness, StoredTx, StoredTxOut};
pub use undo::StoredUndoData;
