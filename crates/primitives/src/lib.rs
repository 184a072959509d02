//! Wire-format primitives: the binary codec, block and transaction
//! decoding, and canonical script-address derivation.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod script;
pub mod transaction;

/// 32-byte hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];
