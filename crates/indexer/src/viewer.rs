//! Read-only facade over the block database for wallet queries.

use std::sync::Arc;

use cairn_blockdb::schema::DUP_VALID;
use cairn_blockdb::{BlockDb, DbError, StoredHeader, StoredScriptHistory, StoredTx};
use cairn_primitives::script::ScrAddr;
use cairn_primitives::Hash256;
use cairn_storage::Column;

#[derive(Clone)]
pub struct BlockDataViewer {
    db: Arc<BlockDb>,
}

impl BlockDataViewer {
    pub fn new(db: Arc<BlockDb>) -> Self {
        Self { db }
    }

    pub fn top_block_height(&self) -> Result<u32, DbError> {
        self.db.get_top_block_height(Column::Headers)
    }

    pub fn top_block_hash(&self) -> Result<Hash256, DbError> {
        self.db.get_top_block_hash(Column::Headers)
    }

    pub fn header_by_hash(&self, hash: &Hash256) -> Result<Option<StoredHeader>, DbError> {
        self.db.get_bare_header_by_hash(hash)
    }

    /// Main-branch header at a height.
    pub fn header_at(&self, height: u32) -> Result<Option<StoredHeader>, DbError> {
        self.db.get_bare_header(height, DUP_VALID)
    }

    pub fn tx_by_hash(&self, tx_hash: &Hash256) -> Result<Option<StoredTx>, DbError> {
        self.db.get_stored_tx_by_hash(tx_hash)
    }

    pub fn balance(&self, scr_addr: &ScrAddr, with_multisig: bool) -> Result<i64, DbError> {
        self.db.get_balance_for_scr_addr(scr_addr, with_multisig)
    }

    pub fn script_history(
        &self,
        scr_addr: &ScrAddr,
        start_block: u32,
        end_block: u32,
    ) -> Result<Option<StoredScriptHistory>, DbError> {
        self.db
            .get_stored_script_history(scr_addr, start_block, end_block)
    }
}
