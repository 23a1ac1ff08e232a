//! Access to the caches maintained by the probes.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Mutex, PoisonError},
};

use bpf_common::{
    Pid,
    maps::{MapError, MapKind, PinnedHashMap},
};

use crate::record::{FileFieldsBytes, PidRecordBytes, ProcRecordBytes};

pub const PID_CACHE_MAP: &str = "pid_cache";
pub const PROC_CACHE_MAP: &str = "proc_cache";
pub const INODE_FILE_MAP: &str = "inode_file";

/// Raw record storage shared with the probes. Missing keys are `Ok(None)`.
pub trait KernelMaps: Send + Sync {
    fn lookup_pid(&self, pid: Pid) -> Result<Option<PidRecordBytes>, MapError>;
    fn lookup_proc(&self, cookie: u64) -> Result<Option<ProcRecordBytes>, MapError>;
    fn put_pid(&self, pid: Pid, record: PidRecordBytes) -> Result<(), MapError>;
    fn put_proc(&self, cookie: u64, record: ProcRecordBytes) -> Result<(), MapError>;
    /// Ask the probes to report the kernel attributes of an inode on the next `stat`.
    fn put_inode_file(&self, inode: u64, record: FileFieldsBytes) -> Result<(), MapError>;
    fn lookup_inode_file(&self, inode: u64) -> Result<Option<FileFieldsBytes>, MapError>;
    fn delete_inode_file(&self, inode: u64) -> Result<(), MapError>;
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Maps pinned on the bpf filesystem.
pub struct PinnedKernelMaps {
    pid_cache: Mutex<PinnedHashMap<u32, PidRecordBytes>>,
    proc_cache: Mutex<PinnedHashMap<u64, ProcRecordBytes>>,
    inode_file: Mutex<PinnedHashMap<u64, FileFieldsBytes>>,
}

impl PinnedKernelMaps {
    pub fn open(dir: &Path) -> Result<Self, MapError> {
        Ok(Self {
            pid_cache: Mutex::new(PinnedHashMap::from_pin(dir, PID_CACHE_MAP, MapKind::LruHash)?),
            proc_cache: Mutex::new(PinnedHashMap::from_pin(
                dir,
                PROC_CACHE_MAP,
                MapKind::LruHash,
            )?),
            inode_file: Mutex::new(PinnedHashMap::from_pin(dir, INODE_FILE_MAP, MapKind::Hash)?),
        })
    }
}

impl KernelMaps for PinnedKernelMaps {
    fn lookup_pid(&self, pid: Pid) -> Result<Option<PidRecordBytes>, MapError> {
        lock(&self.pid_cache).lookup(&(pid.as_raw() as u32))
    }

    fn lookup_proc(&self, cookie: u64) -> Result<Option<ProcRecordBytes>, MapError> {
        lock(&self.proc_cache).lookup(&cookie)
    }

    fn put_pid(&self, pid: Pid, record: PidRecordBytes) -> Result<(), MapError> {
        lock(&self.pid_cache).insert(pid.as_raw() as u32, record)
    }

    fn put_proc(&self, cookie: u64, record: ProcRecordBytes) -> Result<(), MapError> {
        lock(&self.proc_cache).insert(cookie, record)
    }

    fn put_inode_file(&self, inode: u64, record: FileFieldsBytes) -> Result<(), MapError> {
        lock(&self.inode_file).insert(inode, record)
    }

    fn lookup_inode_file(&self, inode: u64) -> Result<Option<FileFieldsBytes>, MapError> {
        lock(&self.inode_file).lookup(&inode)
    }

    fn delete_inode_file(&self, inode: u64) -> Result<(), MapError> {
        lock(&self.inode_file).remove(&inode)
    }
}

#[derive(Default)]
struct MemoryState {
    pids: HashMap<Pid, PidRecordBytes>,
    procs: HashMap<u64, ProcRecordBytes>,
    inodes: HashMap<u64, FileFieldsBytes>,
}

/// In process maps, used when no probes are loaded. The inode map echoes the
/// requested record back since nothing fills it.
#[derive(Default)]
pub struct MemoryKernelMaps {
    state: Mutex<MemoryState>,
}

impl MemoryKernelMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pid_count(&self) -> usize {
        lock(&self.state).pids.len()
    }

    pub fn proc_count(&self) -> usize {
        lock(&self.state).procs.len()
    }

    pub fn remove_pid(&self, pid: Pid) {
        lock(&self.state).pids.remove(&pid);
    }
}

impl KernelMaps for MemoryKernelMaps {
    fn lookup_pid(&self, pid: Pid) -> Result<Option<PidRecordBytes>, MapError> {
        Ok(lock(&self.state).pids.get(&pid).copied())
    }

    fn lookup_proc(&self, cookie: u64) -> Result<Option<ProcRecordBytes>, MapError> {
        Ok(lock(&self.state).procs.get(&cookie).copied())
    }

    fn put_pid(&self, pid: Pid, record: PidRecordBytes) -> Result<(), MapError> {
        lock(&self.state).pids.insert(pid, record);
        Ok(())
    }

    fn put_proc(&self, cookie: u64, record: ProcRecordBytes) -> Result<(), MapError> {
        lock(&self.state).procs.insert(cookie, record);
        Ok(())
    }

    fn put_inode_file(&self, inode: u64, record: FileFieldsBytes) -> Result<(), MapError> {
        lock(&self.state).inodes.insert(inode, record);
        Ok(())
    }

    fn lookup_inode_file(&self, inode: u64) -> Result<Option<FileFieldsBytes>, MapError> {
        Ok(lock(&self.state).inodes.get(&inode).copied())
    }

    fn delete_inode_file(&self, inode: u64) -> Result<(), MapError> {
        lock(&self.state).inodes.remove(&inode);
        Ok(())
    }
}
