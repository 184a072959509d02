//! The raw-block feed the worker consumes.

use cairn_primitives::block::BlockHeader;
use cairn_primitives::Hash256;

/// Provider of serialized blocks by height plus a header lookup, as
/// produced by the block-file reader or the network layer.
pub trait BlockSource: Send + Sync {
    /// Highest height the source can serve, or None when it has nothing.
    fn top_height(&self) -> Option<u32>;

    /// Serialized block at `height` on the source's best branch.
    fn raw_block(&self, height: u32) -> Option<Vec<u8>>;

    /// Resolve a header by hash, for walking branch parents.
    fn header_lookup(&self, hash: &Hash256) -> Option<BlockHeader>;
}
