//! Per-script history: a compact summary plus per-block shards.
//!
//! The summary bounds value size for hot scripts; the shards are keyed by
//! `scrAddr ‖ hgtx` so a range scan yields a script's activity in height
//! order and a reorg can drop one block's worth of activity by deleting
//! one shard.

use std::collections::BTreeMap;

use cairn_primitives::encoding::{DecodeError, Decoder, Encoder};
use cairn_primitives::script::ScrAddr;

use crate::schema::hgtx;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxioKind {
    Received,
    Spent,
    Multisig,
    FromSelf,
}

impl TxioKind {
    pub fn code(self) -> u8 {
        match self {
            TxioKind::Received => 0,
            TxioKind::Spent => 1,
            TxioKind::Multisig => 2,
            TxioKind::FromSelf => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TxioKind::Received),
            1 => Some(TxioKind::Spent),
            2 => Some(TxioKind::Multisig),
            3 => Some(TxioKind::FromSelf),
            _ => None,
        }
    }

    /// Kinds that add to the spendable balance of the script itself.
    pub fn credits_balance(self) -> bool {
        matches!(self, TxioKind::Received | TxioKind::FromSelf)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxioEntry {
    /// DbKey8 of the output the event concerns. For `Spent` entries this
    /// is the consumed prevout, which may live at an earlier height than
    /// the shard.
    pub key: [u8; 8],
    pub kind: TxioKind,
    pub value: i64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredSubHistory {
    pub scr_addr: ScrAddr,
    pub fragment: [u8; 4],
    pub txios: BTreeMap<[u8; 8], TxioEntry>,
}

impl StoredSubHistory {
    pub fn new(scr_addr: ScrAddr, height: u32, dup_id: u8) -> Self {
        Self {
            scr_addr,
            fragment: hgtx(height, dup_id),
            txios: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, entry: TxioEntry) {
        self.txios.insert(entry.key, entry);
    }

    pub fn merge(&mut self, other: &StoredSubHistory) {
        for entry in other.txios.values() {
            self.txios.insert(entry.key, *entry);
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(1 + self.txios.len() * 17);
        encoder.write_varint(self.txios.len() as u64);
        for entry in self.txios.values() {
            encoder.write_u8(entry.kind.code());
            encoder.write_bytes(&entry.key);
            encoder.write_i64_le(entry.value);
        }
        encoder.into_inner()
    }

    pub fn parse(
        scr_addr: ScrAddr,
        fragment: [u8; 4],
        bytes: &[u8],
    ) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder.read_varint()? as usize;
        let mut txios = BTreeMap::new();
        for _ in 0..count {
            let kind = TxioKind::from_code(decoder.read_u8()?)
                .ok_or(DecodeError::InvalidData("unknown txio kind"))?;
            let key = decoder.read_fixed::<8>()?;
            let value = decoder.read_i64_le()?;
            txios.insert(key, TxioEntry { key, kind, value });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            scr_addr,
            fragment,
            txios,
        })
    }
}

const FLAG_MULTIPLE_ENTRIES: u8 = 1 << 0;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredScriptHistory {
    pub scr_addr: ScrAddr,
    pub scanned_up_to: u32,
    pub total_txio_count: u64,
    /// Sum of still-unspent `Received`/`FromSelf` values. Multisig
    /// participation is tracked but not counted here.
    pub total_unspent: i64,
    pub use_multiple_entries: bool,
    pub sub_histories: BTreeMap<[u8; 4], StoredSubHistory>,
}

impl StoredScriptHistory {
    pub fn new(scr_addr: ScrAddr) -> Self {
        Self {
            scr_addr,
            scanned_up_to: 0,
            total_txio_count: 0,
            total_unspent: 0,
            use_multiple_entries: false,
            sub_histories: BTreeMap::new(),
        }
    }

    pub fn serialize_summary(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(22);
        let mut flags = 0u8;
        if self.use_multiple_entries {
            flags |= FLAG_MULTIPLE_ENTRIES;
        }
        encoder.write_u8(flags);
        encoder.write_u32_le(self.scanned_up_to);
        encoder.write_varint(self.total_txio_count);
        encoder.write_i64_le(self.total_unspent);
        encoder.into_inner()
    }

    pub fn parse_summary(scr_addr: ScrAddr, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let flags = decoder.read_u8()?;
        let scanned_up_to = decoder.read_u32_le()?;
        let total_txio_count = decoder.read_varint()?;
        let total_unspent = decoder.read_i64_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            scr_addr,
            scanned_up_to,
            total_txio_count,
            total_unspent,
            use_multiple_entries: flags & FLAG_MULTIPLE_ENTRIES != 0,
            sub_histories: BTreeMap::new(),
        })
    }
}
