//! Shared, recycled process entries.
//!
//! A [`ProcessRef`] is held by the table and by every descendant naming the
//! process as ancestor. When the last holder goes away the entry is cleared
//! and returned to the pool, and the live entry gauge is decremented if the
//! entry was ever counted.

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use bpf_common::Pid;

use crate::{entry::ProcessEntry, stats::Stats};

pub type ProcessRef = Arc<CachedProcess>;

pub struct CachedProcess {
    entry: RwLock<ProcessEntry>,
    counted: AtomicBool,
    pool: Arc<PoolShared>,
}

impl CachedProcess {
    pub fn read(&self) -> RwLockReadGuard<'_, ProcessEntry> {
        self.entry.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ProcessEntry> {
        self.entry.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pid(&self) -> Pid {
        self.read().pid
    }

    /// Count the entry in the live gauge. Returns false if it already was.
    pub(crate) fn mark_counted(&self) -> bool {
        !self.counted.swap(true, Ordering::Relaxed)
    }
}

impl fmt::Debug for CachedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("CachedProcess");
        match self.entry.try_read() {
            Ok(entry) => dbg
                .field("pid", &entry.pid)
                .field("path", &entry.file.path)
                .field("source", &entry.source),
            Err(_) => dbg.field("entry", &"<locked>"),
        }
        .finish()
    }
}

impl Drop for CachedProcess {
    fn drop(&mut self) {
        let entry = std::mem::take(self.entry.get_mut().unwrap_or_else(PoisonError::into_inner));
        self.pool.release(entry, *self.counted.get_mut());
    }
}

struct PoolShared {
    free: Mutex<Vec<ProcessEntry>>,
    capacity: usize,
    stats: Arc<Stats>,
}

impl PoolShared {
    fn release(&self, mut entry: ProcessEntry, counted: bool) {
        let mut ancestor = entry.ancestor.take();
        entry.reset();
        self.put(entry, counted);

        // Unlink the lineage one entry at a time. Each unwrapped entry is
        // dropped without an ancestor, so releasing a chain never recurses.
        while let Some(process) = ancestor {
            ancestor = match Arc::try_unwrap(process) {
                Ok(mut process) => process
                    .entry
                    .get_mut()
                    .unwrap_or_else(PoisonError::into_inner)
                    .ancestor
                    .take(),
                Err(_) => None,
            };
        }
    }

    fn put(&self, entry: ProcessEntry, counted: bool) {
        if counted {
            self.stats.entry_released();
        }
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.capacity {
            free.push(entry);
        }
    }
}

#[derive(Clone)]
pub struct EntryPool {
    shared: Arc<PoolShared>,
}

impl EntryPool {
    pub fn new(capacity: usize, stats: Arc<Stats>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::with_capacity(capacity.min(64))),
                capacity,
                stats,
            }),
        }
    }

    /// A cleared entry, recycled when possible.
    pub fn get(&self) -> ProcessEntry {
        self.shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default()
    }

    /// Share an entry. It returns to the pool once every reference is dropped.
    pub fn seal(&self, entry: ProcessEntry) -> ProcessRef {
        Arc::new(CachedProcess {
            entry: RwLock::new(entry),
            counted: AtomicBool::new(false),
            pool: self.shared.clone(),
        })
    }

    /// Return an entry that was never shared.
    pub fn recycle(&self, entry: ProcessEntry) {
        self.shared.release(entry, false);
    }

    /// Number of entries waiting for reuse.
    pub fn idle(&self) -> usize {
        self.shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
