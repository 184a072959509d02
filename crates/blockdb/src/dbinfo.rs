//! Per-sub-database metadata record.

use cairn_primitives::encoding::{DecodeError, Decoder, Encoder};
use cairn_primitives::{Hash256, ZERO_HASH};

use crate::config::{DbConfig, DbMode, PruneMode};

pub const DB_FORMAT_VERSION: u32 = 1;

/// Height recorded before any block has been applied.
pub const NO_TOP_HEIGHT: u32 = u32::MAX;

/// One of these lives under the `DBINFO` key of every sub-database. The
/// top-block fields are the linearization point for readers: they are the
/// last thing a block-ingest transaction updates.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredDbInfo {
    pub magic: [u8; 4],
    pub db_mode: DbMode,
    pub prune_mode: PruneMode,
    pub version: u32,
    pub top_block_height: u32,
    pub top_block_hash: Hash256,
}

impl StoredDbInfo {
    pub fn fresh(config: &DbConfig) -> Option<Self> {
        Some(Self {
            magic: config.magic_bytes?,
            db_mode: config.db_mode,
            prune_mode: config.prune_mode,
            version: DB_FORMAT_VERSION,
            top_block_height: NO_TOP_HEIGHT,
            top_block_hash: ZERO_HASH,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(46);
        encoder.write_bytes(&self.magic);
        encoder.write_u8(self.db_mode.as_byte());
        encoder.write_u8(self.prune_mode.as_byte());
        encoder.write_u32_le(self.version);
        encoder.write_u32_le(self.top_block_height);
        encoder.write_hash(&self.top_block_hash);
        encoder.into_inner()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let magic = decoder.read_fixed::<4>()?;
        let db_mode = DbMode::from_byte(decoder.read_u8()?)
            .ok_or(DecodeError::InvalidData("unknown database mode"))?;
        let prune_mode = PruneMode::from_byte(decoder.read_u8()?)
            .ok_or(DecodeError::InvalidData("unknown prune mode"))?;
        let version = decoder.read_u32_le()?;
        let top_block_height = decoder.read_u32_le()?;
        let top_block_hash = decoder.read_hash()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            magic,
            db_mode,
            prune_mode,
            version,
            top_block_height,
            top_block_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;

    #[test]
    fn round_trip() {
        let mut config = DbConfig::new("/tmp/x", Backend::Memory, DbMode::Full);
        config.select_network("Main");
        let info = StoredDbInfo::fresh(&config).unwrap();
        assert_eq!(info.top_block_height, NO_TOP_HEIGHT);
        assert_eq!(info.top_block_hash, ZERO_HASH);
        let parsed = StoredDbInfo::parse(&info.serialize()).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn truncated_value_is_rejected() {
        let mut config = DbConfig::new("/tmp/x", Backend::Memory, DbMode::Super);
        config.select_network("Regtest");
        let bytes = StoredDbInfo::fresh(&config).unwrap().serialize();
        assert!(StoredDbInfo::parse(&bytes[..bytes.len() - 1]).is_err());
    }
}
