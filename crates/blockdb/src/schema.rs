//! Key layout.
//!
//! Every key starts with a one-byte family prefix. Integers inside keys
//! are big-endian so lexicographic order equals numeric order: a range
//! scan over `TXDATA` walks blocks in height order, transactions in index
//! order, outputs in output order. Key fragments embedded in values keep
//! their big-endian form.

use cairn_primitives::script::ScrAddr;
use cairn_primitives::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DbPrefix {
    DbInfo,
    HeadHash,
    HeadHgt,
    TxData,
    TxHints,
    Script,
    SubSsh,
    UndoData,
    TrieNode,
    ZcData,
}

impl DbPrefix {
    pub const COUNT: u8 = 0x0a;

    pub const fn byte(self) -> u8 {
        match self {
            DbPrefix::DbInfo => 0x00,
            DbPrefix::HeadHash => 0x01,
            DbPrefix::HeadHgt => 0x02,
            DbPrefix::TxData => 0x03,
            DbPrefix::TxHints => 0x04,
            DbPrefix::Script => 0x05,
            DbPrefix::SubSsh => 0x06,
            DbPrefix::UndoData => 0x07,
            DbPrefix::TrieNode => 0x08,
            DbPrefix::ZcData => 0x09,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(DbPrefix::DbInfo),
            0x01 => Some(DbPrefix::HeadHash),
            0x02 => Some(DbPrefix::HeadHgt),
            0x03 => Some(DbPrefix::TxData),
            0x04 => Some(DbPrefix::TxHints),
            0x05 => Some(DbPrefix::Script),
            0x06 => Some(DbPrefix::SubSsh),
            0x07 => Some(DbPrefix::UndoData),
            0x08 => Some(DbPrefix::TrieNode),
            0x09 => Some(DbPrefix::ZcData),
            _ => None,
        }
    }
}

/// Heights are 24-bit in the key layout; the dup byte shares the fourth
/// byte of the hgtx fragment.
pub const MAX_HEIGHT: u32 = 0x00ff_ffff;

/// Sentinel dup argument meaning "whichever dup is valid at this height".
pub const DUP_VALID: u8 = 0xff;

pub fn hgtx(height: u32, dup: u8) -> [u8; 4] {
    let packed = ((height & MAX_HEIGHT) << 8) | dup as u32;
    packed.to_be_bytes()
}

pub fn hgtx_height(fragment: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*fragment) >> 8
}

pub fn hgtx_dup(fragment: &[u8; 4]) -> u8 {
    fragment[3]
}

pub fn tx_key(height: u32, dup: u8, tx_index: u16) -> [u8; 6] {
    let mut out = [0u8; 6];
    out[0..4].copy_from_slice(&hgtx(height, dup));
    out[4..6].copy_from_slice(&tx_index.to_be_bytes());
    out
}

pub fn txout_key(height: u32, dup: u8, tx_index: u16, txout_index: u16) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..6].copy_from_slice(&tx_key(height, dup, tx_index));
    out[6..8].copy_from_slice(&txout_index.to_be_bytes());
    out
}

pub fn parse_hgtx(bytes: &[u8]) -> Option<(u32, u8)> {
    let fragment: [u8; 4] = bytes.get(0..4)?.try_into().ok()?;
    Some((hgtx_height(&fragment), hgtx_dup(&fragment)))
}

pub fn parse_tx_key(bytes: &[u8]) -> Option<(u32, u8, u16)> {
    if bytes.len() != 6 {
        return None;
    }
    let (height, dup) = parse_hgtx(&bytes[0..4])?;
    let tx_index = u16::from_be_bytes(bytes[4..6].try_into().ok()?);
    Some((height, dup, tx_index))
}

pub fn parse_txout_key(bytes: &[u8]) -> Option<(u32, u8, u16, u16)> {
    if bytes.len() != 8 {
        return None;
    }
    let (height, dup, tx_index) = parse_tx_key(&bytes[0..6])?;
    let txout_index = u16::from_be_bytes(bytes[6..8].try_into().ok()?);
    Some((height, dup, tx_index, txout_index))
}

// Full keys, family prefix included.

pub fn db_info_key() -> [u8; 1] {
    [DbPrefix::DbInfo.byte()]
}

pub fn head_hash_key(hash: &Hash256) -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0] = DbPrefix::HeadHash.byte();
    out[1..].copy_from_slice(hash);
    out
}

pub fn head_hgt_key(height: u32) -> [u8; 5] {
    let mut out = [0u8; 5];
    out[0] = DbPrefix::HeadHgt.byte();
    out[1..].copy_from_slice(&height.to_be_bytes());
    out
}

pub fn parse_head_hgt_key(bytes: &[u8]) -> Option<u32> {
    if bytes.len() != 5 || bytes[0] != DbPrefix::HeadHgt.byte() {
        return None;
    }
    Some(u32::from_be_bytes(bytes[1..5].try_into().ok()?))
}

pub fn blk_data_key(height: u32, dup: u8) -> [u8; 5] {
    let mut out = [0u8; 5];
    out[0] = DbPrefix::TxData.byte();
    out[1..].copy_from_slice(&hgtx(height, dup));
    out
}

pub fn tx_data_key(height: u32, dup: u8, tx_index: u16) -> [u8; 7] {
    let mut out = [0u8; 7];
    out[0] = DbPrefix::TxData.byte();
    out[1..].copy_from_slice(&tx_key(height, dup, tx_index));
    out
}

pub fn txout_data_key(height: u32, dup: u8, tx_index: u16, txout_index: u16) -> [u8; 9] {
    let mut out = [0u8; 9];
    out[0] = DbPrefix::TxData.byte();
    out[1..].copy_from_slice(&txout_key(height, dup, tx_index, txout_index));
    out
}

pub fn tx_hints_key(hash_prefix: &[u8; 4]) -> [u8; 5] {
    let mut out = [0u8; 5];
    out[0] = DbPrefix::TxHints.byte();
    out[1..].copy_from_slice(hash_prefix);
    out
}

pub fn hash_prefix(tx_hash: &Hash256) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&tx_hash[0..4]);
    out
}

pub fn script_key(scr_addr: &ScrAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + scr_addr.as_slice().len());
    out.push(DbPrefix::Script.byte());
    out.extend_from_slice(scr_addr.as_slice());
    out
}

pub fn sub_ssh_key(scr_addr: &ScrAddr, fragment: &[u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + scr_addr.as_slice().len() + 4);
    out.push(DbPrefix::SubSsh.byte());
    out.extend_from_slice(scr_addr.as_slice());
    out.extend_from_slice(fragment);
    out
}

pub fn sub_ssh_prefix(scr_addr: &ScrAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + scr_addr.as_slice().len());
    out.push(DbPrefix::SubSsh.byte());
    out.extend_from_slice(scr_addr.as_slice());
    out
}

pub fn undo_key(height: u32, dup: u8) -> [u8; 5] {
    let mut out = [0u8; 5];
    out[0] = DbPrefix::UndoData.byte();
    out[1..].copy_from_slice(&hgtx(height, dup));
    out
}

// Zero-confirmation records. The 0xffff marker occupies the height range
// no real block reaches, so the zc region sorts after every confirmed
// hgtx; the sequence number keeps arrival order.

pub fn zc_key(sequence: u32) -> [u8; 6] {
    let mut out = [0u8; 6];
    out[0] = 0xff;
    out[1] = 0xff;
    out[2..6].copy_from_slice(&sequence.to_be_bytes());
    out
}

pub fn zc_tx_key(sequence: u32) -> [u8; 7] {
    let mut out = [0u8; 7];
    out[0] = DbPrefix::ZcData.byte();
    out[1..].copy_from_slice(&zc_key(sequence));
    out
}

pub fn zc_txout_key(sequence: u32, txout_index: u16) -> [u8; 9] {
    let mut out = [0u8; 9];
    out[0..7].copy_from_slice(&zc_tx_key(sequence));
    out[7..9].copy_from_slice(&txout_index.to_be_bytes());
    out
}
