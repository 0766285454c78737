//! In-memory store.
//!
//! Entries live in a `BTreeMap`, so scans come back in key order without
//! any bookkeeping. Nothing survives the process.

use std::{collections::BTreeMap, ops::ControlFlow};

use super::{Error, Store};

/// A [`Store`] held entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn scan(&mut self, visitor: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>) -> Result<(), Error> {
        for (key, value) in &self.entries {
            if visitor(key, value).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::ops::ControlFlow;

    use crate::store::{MemoryStore, Store, sequence_key};

    #[test]
    fn scan_is_ordered_by_key() {
        let mut store = MemoryStore::new();
        for n in [3u32, 1, 256, 2] {
            store.put(&sequence_key(n), &n.to_le_bytes()).expect("put");
        }
        let mut seen = Vec::new();
        store
            .scan(&mut |key, _| {
                seen.push(u32::from_be_bytes(key.try_into().expect("four byte key")));
                ControlFlow::Continue(())
            })
            .expect("scan");
        assert_eq!(seen, vec![1, 2, 3, 256]);
    }

    #[test]
    fn scan_stops_on_break() {
        let mut store = MemoryStore::new();
        for n in 1..=10u32 {
            store.put(&sequence_key(n), b"v").expect("put");
        }
        let mut visits = 0;
        store
            .scan(&mut |_, _| {
                visits += 1;
                if visits == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .expect("scan");
        assert_eq!(visits, 3);
        assert_eq!(store.len(), 10);
    }
}
