//! Tx-hash lookup hints.
//!
//! The secondary index from tx hash to tx slot stores only a 4-byte hash
//! prefix per bucket; collisions are expected and resolved by comparing
//! the full hash of each candidate slot.

use cairn_primitives::encoding::{DecodeError, Decoder, Encoder};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredTxHints {
    pub hash_prefix: [u8; 4],
    pub db_keys: Vec<[u8; 6]>,
    /// Index into `db_keys` to try first.
    pub preferred: usize,
}

impl StoredTxHints {
    pub fn new(hash_prefix: [u8; 4]) -> Self {
        Self {
            hash_prefix,
            db_keys: Vec::new(),
            preferred: 0,
        }
    }

    pub fn contains(&self, key: &[u8; 6]) -> bool {
        self.db_keys.iter().any(|candidate| candidate == key)
    }

    pub fn push(&mut self, key: [u8; 6]) {
        if !self.contains(&key) {
            self.db_keys.push(key);
        }
    }

    pub fn remove(&mut self, key: &[u8; 6]) {
        if let Some(position) = self.db_keys.iter().position(|candidate| candidate == key) {
            self.db_keys.remove(position);
            if self.preferred >= self.db_keys.len() {
                self.preferred = 0;
            }
        }
    }

    /// Point the preferred index at `key`, appending it first if absent.
    pub fn set_preferred(&mut self, key: [u8; 6]) {
        match self.db_keys.iter().position(|candidate| *candidate == key) {
            Some(position) => self.preferred = position,
            None => {
                self.db_keys.push(key);
                self.preferred = self.db_keys.len() - 1;
            }
        }
    }

    /// Candidate slots, preferred entry first.
    pub fn keys_preferred_first(&self) -> Vec<[u8; 6]> {
        let mut out = Vec::with_capacity(self.db_keys.len());
        if let Some(preferred) = self.db_keys.get(self.preferred) {
            out.push(*preferred);
        }
        for (index, key) in self.db_keys.iter().enumerate() {
            if index != self.preferred {
                out.push(*key);
            }
        }
        out
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(2 + self.db_keys.len() * 6);
        encoder.write_varint(self.db_keys.len() as u64);
        encoder.write_varint(self.preferred as u64);
        for key in &self.db_keys {
            encoder.write_bytes(key);
        }
        encoder.into_inner()
    }

    pub fn parse(hash_prefix: [u8; 4], bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder.read_varint()? as usize;
        let preferred = decoder.read_varint()? as usize;
        if count > 0 && preferred >= count {
            return Err(DecodeError::InvalidData("preferred hint out of range"));
        }
        let mut db_keys = Vec::with_capacity(count);
        for _ in 0..count {
            db_keys.push(decoder.read_fixed::<6>()?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            hash_prefix,
            db_keys,
            preferred,
        })
    }
}
