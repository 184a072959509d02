//! Per-block undo records.
//!
//! Enough state to reverse a block: the full pre-spend form of every
//! output the block consumed, and the keys of every output it created.

use cairn_primitives::encoding::{DecodeError, Decoder, Encoder};
use cairn_primitives::Hash256;

use crate::schema::parse_txout_key;
use crate::tx::StoredTxOut;

const UNDO_VERSION: u8 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredUndoData {
    pub height: u32,
    pub dup_id: u8,
    pub block_hash: Hash256,
    /// Outputs the block spent, exactly as they stood before the spend.
    pub stxos_removed: Vec<StoredTxOut>,
    /// DbKey8 of every output the block created; rollback deletes them.
    pub outputs_added: Vec<[u8; 8]>,
}

impl StoredUndoData {
    pub fn new(height: u32, dup_id: u8, block_hash: Hash256) -> Self {
        Self {
            height,
            dup_id,
            block_hash,
            stxos_removed: Vec::new(),
            outputs_added: Vec::new(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(UNDO_VERSION);
        encoder.write_hash(&self.block_hash);
        encoder.write_u32_le(self.stxos_removed.len() as u32);
        for stxo in &self.stxos_removed {
            encoder.write_bytes(&stxo.db_key());
            encoder.write_var_bytes(&stxo.serialize());
        }
        encoder.write_u32_le(self.outputs_added.len() as u32);
        for key in &self.outputs_added {
            encoder.write_bytes(key);
        }
        encoder.into_inner()
    }

    pub fn parse(height: u32, dup_id: u8, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported undo version"));
        }
        let block_hash = decoder.read_hash()?;
        let removed_len = decoder.read_u32_le()? as usize;
        let mut stxos_removed = Vec::with_capacity(removed_len);
        for _ in 0..removed_len {
            let key = decoder.read_fixed::<8>()?;
            let (out_height, out_dup, tx_index, txout_index) = parse_txout_key(&key)
                .ok_or(DecodeError::InvalidData("malformed undo output key"))?;
            let value_bytes = decoder.read_var_bytes()?;
            stxos_removed.push(StoredTxOut::parse(
                out_height,
                out_dup,
                tx_index,
                txout_index,
                &value_bytes,
            )?);
        }
        let added_len = decoder.read_u32_le()? as usize;
        let mut outputs_added = Vec::with_capacity(added_len);
        for _ in 0..added_len {
            outputs_added.push(decoder.read_fixed::<8>()?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            height,
            dup_id,
            block_hash,
            stxos_removed,
            outputs_added,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::txout_key;
    use crate::tx::Spentness;

    #[test]
    fn round_trip() {
        let mut sud = StoredUndoData::new(120, 1, [0x55; 32]);
        sud.stxos_removed.push(StoredTxOut {
            height: 100,
            dup_id: 0,
            tx_index: 3,
            txout_index: 1,
            value: 42_000,
            script_pubkey: vec![0x76, 0xa9],
            spentness: Spentness::Unspent,
            is_coinbase: false,
        });
        sud.outputs_added.push(txout_key(120, 1, 0, 0));
        sud.outputs_added.push(txout_key(120, 1, 1, 0));
        let parsed = StoredUndoData::parse(120, 1, &sud.serialize()).unwrap();
        assert_eq!(parsed, sud);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let sud = StoredUndoData::new(1, 0, [0; 32]);
        let mut bytes = sud.serialize();
        bytes[0] = 9;
        assert!(StoredUndoData::parse(1, 0, &bytes).is_err());
    }
}
