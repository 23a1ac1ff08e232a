//! Cached process data.

use std::{fmt, sync::Arc};

use bpf_common::{Pid, parsing::containers::container_id_from_cgroup, time::Timestamp};
use serde::Serialize;

use crate::pool::ProcessRef;

/// Kernel identity and attributes of a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct FileFields {
    pub inode: u64,
    pub mount_id: u32,
    pub path_id: u32,
    pub device: u32,
    pub flags: i32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub mode: u16,
    pub ctime: u64,
    pub mtime: u64,
}

/// How the path of a file was resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathOrigin {
    #[default]
    Unresolved,
    Kernel,
    Procfs,
}

/// A file with its resolved path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileEvent {
    pub fields: FileFields,
    pub path: String,
    pub basename: String,
    pub mount_path: String,
    pub filesystem: String,
    pub origin: PathOrigin,
}

impl FileEvent {
    pub fn with_fields(fields: FileFields) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }

    /// Executables without a backing file, like `memfd_create` images.
    pub fn is_fileless(&self) -> bool {
        self.path.starts_with("/memfd:") || self.path.starts_with("memfd:")
    }

    pub fn set_path(&mut self, path: &str) {
        self.path.clear();
        self.path.push_str(path);
        self.basename.clear();
        self.basename
            .push_str(path.rsplit('/').next().unwrap_or_default());
    }

    fn same_identity(&self, other: &FileEvent) -> bool {
        self.fields.inode == other.fields.inode
            && self.fields.mount_id == other.fields.mount_id
            && self.path == other.path
    }

    fn clear(&mut self) {
        self.fields = FileFields::default();
        self.path.clear();
        self.basename.clear();
        self.mount_path.clear();
        self.filesystem.clear();
        self.origin = PathOrigin::Unresolved;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
    pub fsuid: u32,
    pub fsgid: u32,
    /// Audit login uid, `u32::MAX` when unset.
    pub auid: u32,
    pub cap_effective: u64,
    pub cap_permitted: u64,
    pub user: String,
    pub group: String,
    pub euser: String,
    pub egroup: String,
    pub fsuser: String,
    pub fsgroup: String,
}

impl Credentials {
    fn clear(&mut self) {
        for name in [
            &mut self.user,
            &mut self.group,
            &mut self.euser,
            &mut self.egroup,
            &mut self.fsuser,
            &mut self.fsgroup,
        ] {
            name.clear();
        }
        self.uid = 0;
        self.gid = 0;
        self.euid = 0;
        self.egid = 0;
        self.fsuid = 0;
        self.fsgid = 0;
        self.auid = 0;
        self.cap_effective = 0;
        self.cap_permitted = 0;
    }
}

/// Cgroup membership of a process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CgroupContext {
    pub id: String,
    pub flags: u64,
    pub file_inode: u64,
    pub file_mount_id: u32,
}

impl CgroupContext {
    /// Cgroups managed by systemd units rather than a container runtime.
    pub fn is_systemd(&self) -> bool {
        let unit = [".service", ".scope", ".slice"]
            .iter()
            .any(|suffix| self.id.ends_with(suffix));
        unit && container_id_from_cgroup(&self.id).is_none()
    }

    fn clear(&mut self) {
        self.id.clear();
        self.flags = 0;
        self.file_inode = 0;
        self.file_mount_id = 0;
    }
}

/// Argument or environment values, shared between entries of the same lineage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArgsEnvs {
    pub values: Vec<Arc<str>>,
    pub truncated: bool,
}

/// Busybox style applet aliases of an executable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Symlink {
    pub paths: [String; 2],
    pub basename: String,
}

/// Cloud credentials observed in the process environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityCredential {
    pub access_key_id: String,
    pub kind: String,
    pub expiration: Timestamp,
}

/// Where a cached entry came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    #[default]
    Event,
    KernelMap,
    Procfs,
    Snapshot,
}

impl Source {
    pub(crate) const ALL: [Source; 4] = [
        Source::Event,
        Source::KernelMap,
        Source::Procfs,
        Source::Snapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Event => "event",
            Source::KernelMap => "kernel_map",
            Source::Procfs => "procfs",
            Source::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about a process image.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub pid: Pid,
    pub tid: Pid,
    pub ppid: Pid,
    /// Lineage cookie shared with the probes.
    pub cookie: u64,
    /// Inode of the binary expected to back the process, zero when unknown.
    pub exec_inode: u64,
    pub fork_time: Timestamp,
    pub exec_time: Timestamp,
    pub exit_time: Timestamp,
    pub comm: String,
    pub tty_name: String,
    pub file: FileEvent,
    pub interpreter: Option<FileEvent>,
    pub symlink: Option<Symlink>,
    pub credentials: Credentials,
    pub args_id: u32,
    pub envs_id: u32,
    pub args: Option<Arc<ArgsEnvs>>,
    pub envs: Option<Arc<ArgsEnvs>>,
    pub container_id: String,
    pub cgroup: CgroupContext,
    pub security_credentials: Vec<SecurityCredential>,
    pub ancestor: Option<ProcessRef>,
    pub is_parent_missing: bool,
    pub is_exec: bool,
    pub is_kworker: bool,
    pub source: Source,
}

impl Default for ProcessEntry {
    fn default() -> Self {
        Self {
            pid: Pid::from_raw(0),
            tid: Pid::from_raw(0),
            ppid: Pid::from_raw(0),
            cookie: 0,
            exec_inode: 0,
            fork_time: Timestamp::ZERO,
            exec_time: Timestamp::ZERO,
            exit_time: Timestamp::ZERO,
            comm: String::new(),
            tty_name: String::new(),
            file: FileEvent::default(),
            interpreter: None,
            symlink: None,
            credentials: Credentials::default(),
            args_id: 0,
            envs_id: 0,
            args: None,
            envs: None,
            container_id: String::new(),
            cgroup: CgroupContext::default(),
            security_credentials: Vec::new(),
            ancestor: None,
            is_parent_missing: false,
            is_exec: false,
            is_kworker: false,
            source: Source::Event,
        }
    }
}

impl ProcessEntry {
    pub fn new(pid: Pid, tid: Pid) -> Self {
        Self {
            pid,
            tid,
            ..Default::default()
        }
    }

    /// Clear the entry for reuse, keeping allocated buffers.
    pub(crate) fn reset(&mut self) {
        self.pid = Pid::from_raw(0);
        self.tid = Pid::from_raw(0);
        self.ppid = Pid::from_raw(0);
        self.cookie = 0;
        self.exec_inode = 0;
        self.fork_time = Timestamp::ZERO;
        self.exec_time = Timestamp::ZERO;
        self.exit_time = Timestamp::ZERO;
        self.comm.clear();
        self.tty_name.clear();
        self.file.clear();
        self.interpreter = None;
        self.symlink = None;
        self.credentials.clear();
        self.args_id = 0;
        self.envs_id = 0;
        self.args = None;
        self.envs = None;
        self.container_id.clear();
        self.cgroup.clear();
        self.security_credentials.clear();
        self.ancestor = None;
        self.is_parent_missing = false;
        self.is_exec = false;
        self.is_kworker = false;
        self.source = Source::Event;
    }

    pub fn has_exited(&self) -> bool {
        !self.exit_time.is_zero()
    }

    pub fn args_values(&self) -> &[Arc<str>] {
        self.args.as_deref().map(|a| a.values.as_slice()).unwrap_or_default()
    }

    /// Same binary and interpreter, command name and arguments.
    pub fn same_binary_as(&self, other: &ProcessEntry) -> bool {
        let interpreters_match = match (&self.interpreter, &other.interpreter) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_identity(b),
            _ => false,
        };
        self.file.same_identity(&other.file)
            && interpreters_match
            && self.comm == other.comm
            && self.args_values() == other.args_values()
    }

    /// Two entries describe the same image: the same binary, and the same
    /// fork when both know it. Exec time is not compared, it is what a
    /// repeated exec updates.
    pub fn same_image_as(&self, other: &ProcessEntry) -> bool {
        let fork_match = self.fork_time.is_zero()
            || other.fork_time.is_zero()
            || self.fork_time == other.fork_time;
        self.same_binary_as(other) && fork_match
    }

    /// Fill a freshly forked child from its parent. The child keeps its own
    /// identity and times.
    pub fn inherit_from_parent(&mut self, parent: &ProcessEntry, parent_ref: ProcessRef) {
        self.ppid = parent.pid;
        if self.cookie == 0 {
            self.cookie = parent.cookie;
        }
        self.exec_time = parent.exec_time;
        self.comm.clone_from(&parent.comm);
        self.tty_name.clone_from(&parent.tty_name);
        self.file.clone_from(&parent.file);
        self.interpreter.clone_from(&parent.interpreter);
        self.symlink.clone_from(&parent.symlink);
        self.credentials.clone_from(&parent.credentials);
        self.args_id = parent.args_id;
        self.envs_id = parent.envs_id;
        self.args.clone_from(&parent.args);
        self.envs.clone_from(&parent.envs);
        self.container_id.clone_from(&parent.container_id);
        self.cgroup.clone_from(&parent.cgroup);
        self.is_kworker = parent.is_kworker;
        self.is_exec = false;
        self.ancestor = Some(parent_ref);
    }

    /// Link a new image to the one it replaces. Lineage data unknown to the
    /// exec event is carried over.
    pub fn inherit_from_predecessor(&mut self, prev: &ProcessEntry, prev_ref: ProcessRef) {
        if self.cookie == 0 {
            self.cookie = prev.cookie;
        }
        if self.ppid.as_raw() == 0 {
            self.ppid = prev.ppid;
        }
        if self.fork_time.is_zero() {
            self.fork_time = prev.fork_time;
        }
        if self.container_id.is_empty() {
            self.container_id.clone_from(&prev.container_id);
        }
        if self.cgroup.id.is_empty() {
            self.cgroup.clone_from(&prev.cgroup);
        }
        if self.tty_name.is_empty() {
            self.tty_name.clone_from(&prev.tty_name);
        }
        self.ancestor = Some(prev_ref);
        self.is_exec = true;
    }
}
