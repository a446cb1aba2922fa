//! Bounded, append-only buffer with a monotonically increasing global index.
//!
//! The global index counts every item ever appended, not just the ones still
//! buffered. Item `n` (1-based) carries index `n`; the oldest buffered item is
//! therefore `buffer_start_index() + 1`.
//!
//! One producer (the log tailer timer) and any number of consumers (IPC
//! request handlers) share an `EventLog`; a single mutex guards the
//! buffer/index pair.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default capacity for the structured event buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 200;

/// Result of [`EventLog::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Global index at the time of the query, regardless of `items.len()`.
    pub next_index: u64,
}

#[derive(Debug)]
struct Inner<T> {
    buffer: VecDeque<T>,
    global_index: u64,
}

#[derive(Debug)]
pub struct EventLog<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> EventLog<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                buffer: VecDeque::with_capacity(capacity),
                global_index: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one item, evicting the oldest when over capacity. Returns the
    /// item's global index.
    pub fn append(&self, item: T) -> u64 {
        let mut inner = self.lock();
        Self::push(&mut inner, self.capacity, item)
    }

    /// Append a batch under one lock acquisition.
    pub fn extend<I>(&self, items: I) -> u64
    where
        I: IntoIterator<Item = T>,
    {
        let mut inner = self.lock();
        for item in items {
            Self::push(&mut inner, self.capacity, item);
        }
        inner.global_index
    }

    /// Items with index greater than `since_index`.
    ///
    /// When `since_index` predates the oldest buffered item the whole buffer
    /// is returned: the caller fell behind and must treat the reply as a
    /// catch-up, not as "nothing new".
    pub fn query(&self, since_index: u64) -> Page<T> {
        let inner = self.lock();
        let start = inner.global_index - inner.buffer.len() as u64;
        let skip = since_index.saturating_sub(start);
        let items = if skip >= inner.buffer.len() as u64 {
            Vec::new()
        } else {
            inner.buffer.iter().skip(skip as usize).cloned().collect()
        };
        Page {
            items,
            next_index: inner.global_index,
        }
    }

    /// Reset buffer and global index to zero. Signals an engine restart to
    /// clients holding a cursor.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.buffer.clear();
        inner.global_index = 0;
    }

    pub fn global_index(&self) -> u64 {
        self.lock().global_index
    }

    /// Index of the oldest item still available, minus one.
    pub fn buffer_start_index(&self) -> u64 {
        let inner = self.lock();
        inner.global_index - inner.buffer.len() as u64
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().buffer.is_empty()
    }

    fn push(inner: &mut Inner<T>, capacity: usize, item: T) -> u64 {
        inner.global_index += 1;
        inner.buffer.push_back(item);
        while inner.buffer.len() > capacity {
            inner.buffer.pop_front();
        }
        inner.global_index
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // A panic while holding the lock cannot leave the pair inconsistent:
        // every mutation is a single push/pop/reset.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Default for EventLog<T> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
