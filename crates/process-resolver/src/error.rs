use bpf_common::{
    Pid,
    maps::MapError,
    parsing::{mountinfo::MountinfoError, procfs::ProcfsError},
};
use thiserror::Error;

use crate::pool::ProcessRef;

/// Failure of a pluggable capability resolver.
#[derive(Error, Debug)]
pub enum LookupError {
    #[error(transparent)]
    Procfs(#[from] ProcfsError),
    #[error(transparent)]
    Mountinfo(#[from] MountinfoError),
    #[error("invalid file key inode {inode} mount {mount_id}")]
    InvalidKey { inode: u64, mount_id: u32 },
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("inode {expected} of {path} changed to {found}")]
    InodeMismatch {
        path: String,
        expected: u64,
        found: u64,
    },
}

/// Kernel record decoding failure.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("{record} record needs {expected} bytes, got {actual}")]
    Size {
        record: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("invalid pid {0}")]
    NoPid(Pid),
    #[error("process {0} is a kernel thread")]
    KernelThread(Pid),
    #[error("resolving {what} path failed")]
    PathResolution {
        what: &'static str,
        #[source]
        source: LookupError,
    },
    #[error("resolving filesystem of mount {mount_id} failed")]
    Filesystem {
        mount_id: u32,
        #[source]
        source: LookupError,
    },
    #[error("reading process {pid} from procfs failed")]
    Procfs {
        pid: Pid,
        #[source]
        source: ProcfsError,
    },
    #[error("snapshot of running processes failed")]
    Snapshot(#[source] ProcfsError),
    #[error(transparent)]
    KernelMap(#[from] MapError),
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Returned by exec handling when enrichment of the new image fails. The
/// partially enriched entry is handed back for diagnostics, it was not cached.
#[derive(Error, Debug)]
#[error("exec of process {pid} not recorded")]
pub struct ExecError {
    pub pid: Pid,
    pub entry: Option<ProcessRef>,
    #[source]
    pub source: ResolverError,
}
