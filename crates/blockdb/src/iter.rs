//! Cursor handle over one sub-database.
//!
//! A `DbIter` owns its underlying stream and the current entry, so the
//! bytes it exposes stay stable while the caller decodes them. Entries
//! reflect the store as of the last seek; writes issued afterwards become
//! visible only to a freshly positioned iterator.

use std::sync::Arc;

use cairn_primitives::encoding::Decoder;
use cairn_storage::{Column, KeyValueStore, Store, StoreError, StoreIter};

use crate::schema::DbPrefix;

pub struct DbIter {
    store: Arc<Store>,
    column: Column,
    stream: Option<StoreIter>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl DbIter {
    pub(crate) fn new(store: Arc<Store>, column: Column) -> Self {
        Self {
            store,
            column,
            stream: None,
            current: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_valid_prefix(&self, prefix: DbPrefix) -> bool {
        match &self.current {
            Some((key, _)) => key.first() == Some(&prefix.byte()),
            None => false,
        }
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(key, _)| key.as_slice())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, value)| value.as_slice())
    }

    /// Fresh reader over the current key, positioned at zero.
    pub fn key_reader(&self) -> Option<Decoder<'_>> {
        self.key().map(Decoder::new)
    }

    /// Fresh reader over the current value, positioned at zero.
    pub fn value_reader(&self) -> Option<Decoder<'_>> {
        self.value().map(Decoder::new)
    }

    fn invalidate(&mut self) {
        self.stream = None;
        self.current = None;
    }

    fn load_forward_from(&mut self, start: &[u8]) -> Result<bool, StoreError> {
        let mut stream = self.store.iter_from(self.column, start)?;
        match stream.next() {
            Some(Ok(entry)) => {
                self.current = Some(entry);
                self.stream = Some(stream);
                Ok(true)
            }
            Some(Err(err)) => {
                self.invalidate();
                Err(err)
            }
            None => {
                self.invalidate();
                Ok(false)
            }
        }
    }

    /// Position on the smallest entry >= `key`.
    pub fn seek_to(&mut self, key: &[u8]) -> Result<bool, StoreError> {
        self.load_forward_from(key)
    }

    /// Same movement as `seek_to`; true only on an exact key match.
    pub fn seek_to_exact(&mut self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.seek_to(key)? && self.check_key_exact(key))
    }

    /// Seek and verify the landed key begins with `start`.
    pub fn seek_to_starts_with(&mut self, start: &[u8]) -> Result<bool, StoreError> {
        Ok(self.seek_to(start)? && self.check_key_starts_with(start))
    }

    /// Seek to `prefix ‖ tail` and verify the landed key is in `prefix`'s
    /// family.
    pub fn seek_to_prefix(&mut self, prefix: DbPrefix, tail: &[u8]) -> Result<bool, StoreError> {
        let mut key = Vec::with_capacity(1 + tail.len());
        key.push(prefix.byte());
        key.extend_from_slice(tail);
        Ok(self.seek_to(&key)? && self.is_valid_prefix(prefix))
    }

    pub fn seek_to_first(&mut self) -> Result<bool, StoreError> {
        self.load_forward_from(&[])
    }

    /// Position on the largest entry <= `key`. Leaves the forward stream
    /// unsynced; the next advance re-seeks from the landed key.
    pub fn seek_to_before(&mut self, key: &[u8]) -> Result<bool, StoreError> {
        let mut stream = self.store.iter_rev_from(self.column, key)?;
        match stream.next() {
            Some(Ok(entry)) => {
                self.current = Some(entry);
                self.stream = None;
                Ok(true)
            }
            Some(Err(err)) => {
                self.invalidate();
                Err(err)
            }
            None => {
                self.invalidate();
                Ok(false)
            }
        }
    }

    /// Step forward. An invalid iterator stays invalid.
    pub fn advance(&mut self) -> Result<bool, StoreError> {
        let Some((current_key, _)) = &self.current else {
            return Ok(false);
        };
        let current_key = current_key.clone();

        if self.stream.is_none() {
            // Resynchronize after a backward movement.
            let mut stream = self.store.iter_from(self.column, &current_key)?;
            match stream.next() {
                Some(Ok((key, _))) if key == current_key => {
                    self.stream = Some(stream);
                }
                Some(Ok(entry)) => {
                    // The old position vanished; the next entry is already
                    // the successor.
                    self.current = Some(entry);
                    self.stream = Some(stream);
                    return Ok(true);
                }
                Some(Err(err)) => {
                    self.invalidate();
                    return Err(err);
                }
                None => {
                    self.invalidate();
                    return Ok(false);
                }
            }
        }

        match self.stream.as_mut().expect("stream synced").next() {
            Some(Ok(entry)) => {
                self.current = Some(entry);
                Ok(true)
            }
            Some(Err(err)) => {
                self.invalidate();
                Err(err)
            }
            None => {
                self.invalidate();
                Ok(false)
            }
        }
    }

    /// Step forward, declaring the iterator invalid once it leaves
    /// `prefix`'s family.
    pub fn advance_prefix(&mut self, prefix: DbPrefix) -> Result<bool, StoreError> {
        if !self.advance()? {
            return Ok(false);
        }
        if !self.is_valid_prefix(prefix) {
            self.invalidate();
            return Ok(false);
        }
        Ok(true)
    }

    /// Step backward. Leaves the forward stream unsynced.
    pub fn retreat(&mut self) -> Result<bool, StoreError> {
        let Some((current_key, _)) = &self.current else {
            return Ok(false);
        };
        let current_key = current_key.clone();
        let mut stream = self.store.iter_rev_from(self.column, &current_key)?;
        loop {
            match stream.next() {
                Some(Ok((key, value))) => {
                    if key == current_key {
                        continue;
                    }
                    self.current = Some((key, value));
                    self.stream = None;
                    return Ok(true);
                }
                Some(Err(err)) => {
                    self.invalidate();
                    return Err(err);
                }
                None => {
                    self.invalidate();
                    return Ok(false);
                }
            }
        }
    }

    /// Non-moving predicate: valid and exactly on `key`.
    pub fn check_key_exact(&self, key: &[u8]) -> bool {
        self.key() == Some(key)
    }

    /// Non-moving predicate: valid and the key begins with `start`.
    pub fn check_key_starts_with(&self, start: &[u8]) -> bool {
        self.key().is_some_and(|key| key.starts_with(start))
    }
}
