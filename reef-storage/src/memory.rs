//! In-memory LRU-bounded storage engine.

use std::sync::Mutex;

use hashbrown::HashMap;

use reef_common::error::{ReefError, ReefResult};

use crate::store::{Storage, StoredValue};

#[derive(Debug)]
struct Entry {
    data: Vec<u8>,
    flags: u32,
    /// Logical access clock value; the smallest one in the table is the eviction victim.
    touched: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: HashMap<String, Entry>,
    clock: u64,
    used_bytes: usize,
}

impl StoreInner {
    fn tick(&mut self) -> u64 {
        self.clock = self.clock.saturating_add(1);
        self.clock
    }

    fn entry_bytes(key: &str, data_len: usize) -> usize {
        key.len().saturating_add(data_len)
    }

    fn remove(&mut self, key: &str) -> bool {
        if let Some(entry) = self.entries.remove(key) {
            self.used_bytes = self
                .used_bytes
                .saturating_sub(Self::entry_bytes(key, entry.data.len()));
            return true;
        }
        false
    }

    /// Evicts least-recently-touched entries until `incoming_bytes` fits under `max_bytes`.
    fn make_room(&mut self, incoming_bytes: usize, max_bytes: usize) {
        while self.used_bytes.saturating_add(incoming_bytes) > max_bytes {
            let Some(victim) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(key, _)| key.clone())
            else {
                return;
            };
            let _ = self.remove(&victim);
        }
    }

    fn insert(&mut self, key: &str, data: Vec<u8>, flags: u32) {
        let touched = self.tick();
        self.used_bytes = self
            .used_bytes
            .saturating_add(Self::entry_bytes(key, data.len()));
        let _ = self.entries.insert(
            key.to_owned(),
            Entry {
                data,
                flags,
                touched,
            },
        );
    }
}

/// Thread-safe in-memory engine with an optional byte-capacity bound.
///
/// When the bound is hit, least-recently-used entries are evicted to admit new writes. A single
/// entry larger than the whole capacity is rejected with a recoverable execution error instead.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Capacity in bytes; `0` disables the bound.
    max_bytes: usize,
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    /// Creates an unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store bounded to `max_bytes` of key+value payload. `0` means unbounded.
    #[must_use]
    pub fn with_capacity(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    fn lock(&self) -> ReefResult<std::sync::MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|_| ReefError::InvalidState("storage mutex is poisoned"))
    }

    fn check_fits(&self, key: &str, data_len: usize) -> ReefResult<()> {
        if self.max_bytes > 0 && StoreInner::entry_bytes(key, data_len) > self.max_bytes {
            return Err(ReefError::Execution(
                "entry exceeds cache capacity".to_owned(),
            ));
        }
        Ok(())
    }

    /// Number of live entries, used by tests.
    ///
    /// # Errors
    ///
    /// Returns `ReefError::InvalidState` when the engine mutex is poisoned.
    pub fn len(&self) -> ReefResult<usize> {
        Ok(self.lock()?.entries.len())
    }

    /// Returns `true` when the store holds no entries.
    ///
    /// # Errors
    ///
    /// Returns `ReefError::InvalidState` when the engine mutex is poisoned.
    pub fn is_empty(&self) -> ReefResult<bool> {
        Ok(self.lock()?.entries.is_empty())
    }
}

impl Storage for MemoryStore {
    fn set(&self, key: &str, value: StoredValue) -> ReefResult<()> {
        self.check_fits(key, value.data.len())?;
        let mut inner = self.lock()?;
        let _ = inner.remove(key);
        if self.max_bytes > 0 {
            let incoming = StoreInner::entry_bytes(key, value.data.len());
            inner.make_room(incoming, self.max_bytes);
        }
        inner.insert(key, value.data, value.flags);
        Ok(())
    }

    fn put_if_absent(&self, key: &str, value: StoredValue) -> ReefResult<bool> {
        self.check_fits(key, value.data.len())?;
        let mut inner = self.lock()?;
        if inner.entries.contains_key(key) {
            return Ok(false);
        }
        if self.max_bytes > 0 {
            let incoming = StoreInner::entry_bytes(key, value.data.len());
            inner.make_room(incoming, self.max_bytes);
        }
        inner.insert(key, value.data, value.flags);
        Ok(true)
    }

    fn replace(&self, key: &str, value: StoredValue) -> ReefResult<bool> {
        self.check_fits(key, value.data.len())?;
        let mut inner = self.lock()?;
        if !inner.entries.contains_key(key) {
            return Ok(false);
        }
        let _ = inner.remove(key);
        if self.max_bytes > 0 {
            let incoming = StoreInner::entry_bytes(key, value.data.len());
            inner.make_room(incoming, self.max_bytes);
        }
        inner.insert(key, value.data, value.flags);
        Ok(true)
    }

    fn append(&self, key: &str, suffix: &[u8]) -> ReefResult<bool> {
        let mut inner = self.lock()?;
        let Some(entry) = inner.entries.get(key) else {
            return Ok(false);
        };
        let grown_len = entry.data.len().saturating_add(suffix.len());
        self.check_fits(key, grown_len)?;

        let touched = inner.tick();
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.data.extend_from_slice(suffix);
            entry.touched = touched;
        }
        inner.used_bytes = inner.used_bytes.saturating_add(suffix.len());
        if self.max_bytes > 0 {
            // The grown entry carries the freshest touch, so eviction targets other keys.
            inner.make_room(0, self.max_bytes);
        }
        Ok(true)
    }

    fn prepend(&self, key: &str, prefix: &[u8]) -> ReefResult<bool> {
        let mut inner = self.lock()?;
        let Some(entry) = inner.entries.get(key) else {
            return Ok(false);
        };
        let grown_len = entry.data.len().saturating_add(prefix.len());
        self.check_fits(key, grown_len)?;

        let touched = inner.tick();
        if let Some(entry) = inner.entries.get_mut(key) {
            let mut data = Vec::with_capacity(grown_len);
            data.extend_from_slice(prefix);
            data.extend_from_slice(&entry.data);
            entry.data = data;
            entry.touched = touched;
        }
        inner.used_bytes = inner.used_bytes.saturating_add(prefix.len());
        if self.max_bytes > 0 {
            inner.make_room(0, self.max_bytes);
        }
        Ok(true)
    }

    fn get(&self, key: &str) -> ReefResult<Option<StoredValue>> {
        let mut inner = self.lock()?;
        let next_touch = inner.tick();
        let Some(entry) = inner.entries.get_mut(key) else {
            return Ok(None);
        };
        entry.touched = next_touch;
        Ok(Some(StoredValue {
            data: entry.data.clone(),
            flags: entry.flags,
        }))
    }

    fn delete(&self, key: &str) -> ReefResult<bool> {
        let mut inner = self.lock()?;
        Ok(inner.remove(key))
    }
}
