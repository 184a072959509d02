//! Stored block headers and the per-height header list.

use std::collections::BTreeMap;

use cairn_primitives::block::{Block, BlockHeader, HEADER_SIZE};
use cairn_primitives::encoding::{decode, DecodeError, Decoder, Encoder};
use cairn_primitives::hash::sha256d;
use cairn_primitives::Hash256;

use crate::schema::{hgtx, hgtx_dup, hgtx_height};
use crate::tx::StoredTx;

const FLAG_APPLIED: u8 = 1 << 0;

/// A block header as stored, optionally carrying its transactions when
/// materialized with block data.
#[derive(Clone, Debug)]
pub struct StoredHeader {
    pub hash: Hash256,
    pub raw_header: [u8; HEADER_SIZE],
    pub height: u32,
    pub dup_id: u8,
    pub num_tx: u32,
    pub num_bytes: u32,
    pub merkle: Vec<u8>,
    /// True once the block's effects (spentness, history, top pointer)
    /// have been applied.
    pub block_applied: bool,
    pub txs: BTreeMap<u16, StoredTx>,
}

impl StoredHeader {
    pub fn from_block(block: &Block, height: u32) -> Self {
        let raw_header = block.header.serialize();
        let hash = sha256d(&raw_header);
        let num_bytes = cairn_primitives::encoding::encode(block).len() as u32;
        let mut txs = BTreeMap::new();
        for (index, tx) in block.transactions.iter().enumerate() {
            let index = index as u16;
            txs.insert(index, StoredTx::from_transaction(tx, height, 0, index));
        }
        Self {
            hash,
            raw_header,
            height,
            dup_id: 0,
            num_tx: block.transactions.len() as u32,
            num_bytes,
            merkle: Vec::new(),
            block_applied: false,
            txs,
        }
    }

    pub fn header(&self) -> Result<BlockHeader, DecodeError> {
        decode(&self.raw_header)
    }

    /// Rebuild the full block. Requires the tx map to be fully populated
    /// with unfragmented output data.
    pub fn to_block(&self) -> Option<Block> {
        let header = self.header().ok()?;
        let mut transactions = Vec::with_capacity(self.num_tx as usize);
        for index in 0..self.num_tx as u16 {
            transactions.push(self.txs.get(&index)?.to_transaction()?);
        }
        Some(Block {
            header,
            transactions,
        })
    }

    /// Propagate an assigned dup id into the child records.
    pub fn set_dup_id(&mut self, dup_id: u8) {
        self.dup_id = dup_id;
        for tx in self.txs.values_mut() {
            tx.dup_id = dup_id;
            for txout in tx.outputs.values_mut() {
                txout.dup_id = dup_id;
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE + 16 + self.merkle.len());
        let mut flags = 0u8;
        if self.block_applied {
            flags |= FLAG_APPLIED;
        }
        encoder.write_u8(flags);
        encoder.write_bytes(&self.raw_header);
        encoder.write_bytes(&hgtx(self.height, self.dup_id));
        encoder.write_u32_le(self.num_tx);
        encoder.write_u32_le(self.num_bytes);
        encoder.write_var_bytes(&self.merkle);
        encoder.into_inner()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let flags = decoder.read_u8()?;
        let raw_header = decoder.read_fixed::<HEADER_SIZE>()?;
        let fragment = decoder.read_fixed::<4>()?;
        let num_tx = decoder.read_u32_le()?;
        let num_bytes = decoder.read_u32_le()?;
        let merkle = decoder.read_var_bytes()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            hash: sha256d(&raw_header),
            raw_header,
            height: hgtx_height(&fragment),
            dup_id: hgtx_dup(&fragment),
            num_tx,
            num_bytes,
            merkle,
            block_applied: flags & FLAG_APPLIED != 0,
            txs: BTreeMap::new(),
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeadHgtEntry {
    pub dup_id: u8,
    pub hash: Hash256,
}

/// Every header seen at one height. At most one dup carries the valid
/// bit; side-branch headers keep their slot so dup assignment is stable
/// across reorgs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredHeadHgtList {
    pub height: u32,
    pub entries: Vec<HeadHgtEntry>,
    pub valid_dup: Option<u8>,
}

const VALID_BIT: u8 = 0x80;
const ENTRY_LEN: usize = 33;

impl StoredHeadHgtList {
    pub fn new(height: u32) -> Self {
        Self {
            height,
            entries: Vec::new(),
            valid_dup: None,
        }
    }

    pub fn dup_for_hash(&self, hash: &Hash256) -> Option<u8> {
        self.entries
            .iter()
            .find(|entry| entry.hash == *hash)
            .map(|entry| entry.dup_id)
    }

    pub fn hash_for_dup(&self, dup_id: u8) -> Option<Hash256> {
        self.entries
            .iter()
            .find(|entry| entry.dup_id == dup_id)
            .map(|entry| entry.hash)
    }

    pub fn next_dup(&self) -> u8 {
        self.entries.len() as u8
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * ENTRY_LEN);
        for entry in &self.entries {
            let mut dup = entry.dup_id;
            if self.valid_dup == Some(entry.dup_id) {
                dup |= VALID_BIT;
            }
            out.push(dup);
            out.extend_from_slice(&entry.hash);
        }
        out
    }

    pub fn parse(height: u32, bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() % ENTRY_LEN != 0 {
            return Err(DecodeError::InvalidData("malformed header-height list"));
        }
        let mut entries = Vec::with_capacity(bytes.len() / ENTRY_LEN);
        let mut valid_dup = None;
        for chunk in bytes.chunks_exact(ENTRY_LEN) {
            let dup_id = chunk[0] & !VALID_BIT;
            if chunk[0] & VALID_BIT != 0 {
                if valid_dup.is_some() {
                    return Err(DecodeError::InvalidData(
                        "two dups marked valid at one height",
                    ));
                }
                valid_dup = Some(dup_id);
            }
            let hash: Hash256 = chunk[1..33].try_into().expect("entry length");
            entries.push(HeadHgtEntry { dup_id, hash });
        }
        Ok(Self {
            height,
            entries,
            valid_dup,
        })
    }
}
