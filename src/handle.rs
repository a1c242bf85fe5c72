//! Handle tables
//!
//! Objects handed to the host are never exposed by address. Each one is stored
//! behind an `Arc` in a table and identified by a generated integer that is
//! never reused for the lifetime of the process, so stale handles are detected
//! instead of dereferenced.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Shared by every table so that no two live objects, of any kind, share a value.
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// The raw value reserved as "no object".
pub const INVALID_HANDLE: u64 = 0;

/// An opaque, non-zero object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU64);

impl Handle {
    /// Interprets a raw value received from the host; `0` is never a handle.
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Handle)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    fn next() -> Self {
        loop {
            let raw = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
            if let Some(handle) = Handle::from_raw(raw) {
                return handle;
            }
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// A table of live objects keyed by handle.
pub struct HandleTable<T> {
    entries: DashMap<Handle, Arc<T>>,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Stores `value` and returns its fresh handle.
    pub fn insert(&self, value: T) -> Handle {
        self.insert_with(|_| value)
    }

    /// Stores the value built by `make`, which receives the handle it will live under.
    pub fn insert_with(&self, make: impl FnOnce(Handle) -> T) -> Handle {
        let handle = Handle::next();
        self.entries.insert(handle, Arc::new(make(handle)));
        handle
    }

    /// Like [`insert_with`](Self::insert_with), but nothing is stored if `make` fails.
    ///
    /// The handle is consumed either way; it will never be issued again.
    pub fn try_insert_with<E>(
        &self,
        make: impl FnOnce(Handle) -> Result<T, E>,
    ) -> Result<Handle, E> {
        let handle = Handle::next();
        let value = make(handle)?;
        self.entries.insert(handle, Arc::new(value));
        Ok(handle)
    }

    /// Returns a clone of the entry; the table lock is released before returning.
    pub fn get(&self, handle: Handle) -> Option<Arc<T>> {
        self.entries.get(&handle).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn remove(&self, handle: Handle) -> Option<Arc<T>> {
        self.entries.remove(&handle).map(|(_, value)| value)
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<(Handle, Arc<T>)> {
        let handles: Vec<Handle> = self.entries.iter().map(|entry| *entry.key()).collect();
        handles
            .into_iter()
            .filter_map(|handle| self.remove(handle).map(|value| (handle, value)))
            .collect()
    }

    /// Finds the first entry matching `predicate`.
    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<(Handle, Arc<T>)> {
        self.entries
            .iter()
            .find(|entry| predicate(entry.value()))
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
