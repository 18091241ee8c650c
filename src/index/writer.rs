use crate::error::{Result, SearchBindError};
use dashmap::DashSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Tantivy refuses writer buffers below this size.
pub const MIN_WRITER_BUFFER_BYTES: usize = 15_000_000;
pub const DEFAULT_WRITER_BUFFER_BYTES: usize = 20_000_000;

/// Tracks open index writers. At most one writer per index name may exist,
/// and the total stays under `max_concurrent_writers`.
pub struct WriterRegistry {
    open: Arc<DashSet<String>>,
    active_writers: Arc<AtomicUsize>,
    max_concurrent_writers: usize,
}

impl Default for WriterRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}

impl WriterRegistry {
    pub fn new(max_concurrent_writers: usize) -> Self {
        WriterRegistry {
            open: Arc::new(DashSet::new()),
            active_writers: Arc::new(AtomicUsize::new(0)),
            max_concurrent_writers,
        }
    }

    pub fn acquire(&self, index_name: &str) -> Result<WriterGuard> {
        if !self.open.insert(index_name.to_string()) {
            return Err(SearchBindError::illegal_state(format!(
                "A writer is already open for index '{}'",
                index_name
            )));
        }

        let current = self.active_writers.fetch_add(1, Ordering::SeqCst);
        if current >= self.max_concurrent_writers {
            self.active_writers.fetch_sub(1, Ordering::SeqCst);
            self.open.remove(index_name);
            return Err(SearchBindError::illegal_state(format!(
                "Too many open writers ({} of {})",
                current + 1,
                self.max_concurrent_writers
            )));
        }

        Ok(WriterGuard {
            index_name: index_name.to_string(),
            open: Arc::clone(&self.open),
            active_writers: Arc::clone(&self.active_writers),
        })
    }

    pub fn validate_buffer_size(requested: usize) -> Result<usize> {
        if requested < MIN_WRITER_BUFFER_BYTES {
            return Err(SearchBindError::config(format!(
                "Writer buffer of {} bytes is below the minimum of {} bytes",
                requested, MIN_WRITER_BUFFER_BYTES
            )));
        }
        Ok(requested)
    }

    pub fn is_open(&self, index_name: &str) -> bool {
        self.open.contains(index_name)
    }

    pub fn active_writers(&self) -> usize {
        self.active_writers.load(Ordering::SeqCst)
    }
}

pub struct WriterGuard {
    index_name: String,
    open: Arc<DashSet<String>>,
    active_writers: Arc<AtomicUsize>,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.open.remove(&self.index_name);
        self.active_writers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A tantivy writer that releases its registry slot when dropped.
pub struct ManagedIndexWriter {
    inner: tantivy::IndexWriter,
    _guard: WriterGuard,
}

impl ManagedIndexWriter {
    pub(crate) fn new(inner: tantivy::IndexWriter, guard: WriterGuard) -> Self {
        ManagedIndexWriter {
            inner,
            _guard: guard,
        }
    }
}

impl Deref for ManagedIndexWriter {
    type Target = tantivy::IndexWriter;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for ManagedIndexWriter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
