//! Deployment modes and network selection.

use std::path::PathBuf;

use cairn_primitives::Hash256;

/// How much the database indexes beyond raw blocks. Only `Full` and
/// `Super` have open paths today; the other variants are recognized in
/// stored DBInfo records so a foreign database is rejected cleanly.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DbMode {
    Bare,
    Lite,
    Partial,
    Full,
    Super,
    Whatever,
}

impl DbMode {
    pub const fn as_byte(self) -> u8 {
        match self {
            DbMode::Bare => 0,
            DbMode::Lite => 1,
            DbMode::Partial => 2,
            DbMode::Full => 3,
            DbMode::Super => 4,
            DbMode::Whatever => 5,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(DbMode::Bare),
            1 => Some(DbMode::Lite),
            2 => Some(DbMode::Partial),
            3 => Some(DbMode::Full),
            4 => Some(DbMode::Super),
            5 => Some(DbMode::Whatever),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PruneMode {
    All,
    None,
    Whatever,
}

impl PruneMode {
    pub const fn as_byte(self) -> u8 {
        match self {
            PruneMode::All => 0,
            PruneMode::None => 1,
            PruneMode::Whatever => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PruneMode::All),
            1 => Some(PruneMode::None),
            2 => Some(PruneMode::Whatever),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DbConfig {
    pub base_dir: PathBuf,
    pub backend: Backend,
    pub db_mode: DbMode,
    pub prune_mode: PruneMode,
    pub magic_bytes: Option<[u8; 4]>,
    pub genesis_block_hash: Option<Hash256>,
    pub genesis_tx_hash: Option<Hash256>,
}

impl DbConfig {
    pub fn new(base_dir: impl Into<PathBuf>, backend: Backend, db_mode: DbMode) -> Self {
        Self {
            base_dir: base_dir.into(),
            backend,
            db_mode,
            prune_mode: PruneMode::None,
            magic_bytes: None,
            genesis_block_hash: None,
            genesis_tx_hash: None,
        }
    }

    /// Populate magic bytes and genesis constants for a recognized network
    /// name. Unknown names leave the fields unset; the open path rejects an
    /// unselected config.
    pub fn select_network(&mut self, name: &str) {
        let constants = match name {
            "Main" => NetworkConstants {
                magic: [0xf9, 0xbe, 0xb4, 0xd9],
                genesis_block:
                    "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
                genesis_tx: GENESIS_TX_HEX,
            },
            "Test" => NetworkConstants {
                magic: [0x0b, 0x11, 0x09, 0x07],
                genesis_block:
                    "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
                genesis_tx: GENESIS_TX_HEX,
            },
            "Regtest" => NetworkConstants {
                magic: [0xfa, 0xbf, 0xb5, 0xda],
                genesis_block:
                    "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
                genesis_tx: GENESIS_TX_HEX,
            },
            _ => return,
        };
        self.magic_bytes = Some(constants.magic);
        self.genesis_block_hash = hash256_from_hex(constants.genesis_block).ok();
        self.genesis_tx_hash = hash256_from_hex(constants.genesis_tx).ok();
    }

    pub fn is_network_selected(&self) -> bool {
        self.magic_bytes.is_some() && self.genesis_block_hash.is_some()
    }
}

struct NetworkConstants {
    magic: [u8; 4],
    genesis_block: &'static str,
    genesis_tx: &'static str,
}

// The coinbase of the genesis block is the same transaction on all three
// networks.
const GENESIS_TX_HEX: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

#[derive(Debug, Eq, PartialEq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

/// Parse a 64-digit hash written in display order (as RPC prints it) into
/// internal little-endian byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let hex = input.trim();
    let hex = hex
        .strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex);
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }

    let mut out = [0u8; 32];
    let bytes = hex.as_bytes();
    for (i, chunk) in bytes.chunks_exact(2).enumerate() {
        let high = hex_digit(chunk[0]).ok_or(HexError::InvalidHex)?;
        let low = hex_digit(chunk[1]).ok_or(HexError::InvalidHex)?;
        // Display order is reversed relative to the internal order.
        out[31 - i] = (high << 4) | low;
    }
    Ok(out)
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
