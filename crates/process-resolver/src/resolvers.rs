//! Capabilities the resolver delegates to: container, mount, path, environment,
//! user/group and boot time resolution. Each has a procfs backed implementation.

use std::{
    fs,
    num::NonZeroUsize,
    os::unix::fs::MetadataExt,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use bpf_common::{
    Pid,
    parsing::{
        containers::container_id_from_cgroup,
        mountinfo::{self, MountinfoError},
        procfs,
    },
    time::Timestamp,
};
use lru::LruCache;
use nix::unistd::{Gid, Group, Uid, User};

use crate::{
    entry::{CgroupContext, FileFields, PathOrigin},
    error::LookupError,
};

/// Container membership of a process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerContext {
    pub container_id: String,
    pub cgroup: CgroupContext,
}

pub trait ContainerResolver: Send + Sync {
    fn container_context(&self, pid: Pid) -> Result<ContainerContext, LookupError>;
}

pub trait MountResolver: Send + Sync {
    /// Filesystem type of a mount, like `ext4` or `overlay`.
    fn filesystem(&self, pid: Pid, mount_id: u32) -> Result<String, LookupError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: String,
    pub mount_path: String,
    pub origin: PathOrigin,
}

pub trait PathResolver: Send + Sync {
    /// Path of the file identified by `fields`, as seen by process `pid`.
    fn resolve(
        &self,
        fields: &FileFields,
        pid: Pid,
        container_id: &str,
    ) -> Result<ResolvedPath, LookupError>;
}

pub trait EnvVarsResolver: Send + Sync {
    /// Environment of a live process and whether it was truncated.
    fn env_vars(&self, pid: Pid) -> Result<(Vec<String>, bool), LookupError>;
}

pub trait UserGroupResolver: Send + Sync {
    fn user(&self, uid: u32, container_id: &str) -> Option<String>;
    fn group(&self, gid: u32, container_id: &str) -> Option<String>;
}

pub trait TimeResolver: Send + Sync {
    fn boot_time(&self) -> Timestamp;

    /// Convert nanoseconds since boot to wall clock. Zero stays zero.
    fn apply_boot_time(&self, since_boot_ns: u64) -> Timestamp {
        if since_boot_ns == 0 {
            return Timestamp::ZERO;
        }
        self.boot_time() + since_boot_ns
    }

    /// Convert wall clock back to nanoseconds since boot. Zero stays zero.
    fn since_boot(&self, ts: Timestamp) -> u64 {
        if ts.is_zero() {
            return 0;
        }
        (ts - self.boot_time()).raw()
    }
}

/// Every capability used by the resolver.
#[derive(Clone)]
pub struct Resolvers {
    pub container: Arc<dyn ContainerResolver>,
    pub mount: Arc<dyn MountResolver>,
    pub path: Arc<dyn PathResolver>,
    pub env_vars: Arc<dyn EnvVarsResolver>,
    pub user_group: Arc<dyn UserGroupResolver>,
    pub time: Arc<dyn TimeResolver>,
}

impl Resolvers {
    /// Procfs backed resolvers for the running host.
    pub fn system(max_envs: usize) -> Result<Self, LookupError> {
        Ok(Self {
            container: Arc::new(ProcfsContainerResolver::new()),
            mount: Arc::new(ProcfsMountResolver),
            path: Arc::new(ProcfsPathResolver),
            env_vars: Arc::new(ProcfsEnvVarsResolver { max_envs }),
            user_group: Arc::new(SystemUserGroupResolver::default()),
            time: Arc::new(BootTimeResolver::from_procfs()?),
        })
    }
}

/// Reads `/proc/<pid>/cgroup` and identifies the cgroup directory inode.
pub struct ProcfsContainerResolver {
    cgroup2_mountpoint: Option<String>,
}

impl ProcfsContainerResolver {
    pub fn new() -> Self {
        let cgroup2_mountpoint = match mountinfo::get_cgroup2_mountpoint() {
            Ok(mountpoint) => Some(mountpoint),
            Err(err) => {
                log::debug!("cgroup inodes unavailable: {err}");
                None
            }
        };
        Self { cgroup2_mountpoint }
    }
}

impl Default for ProcfsContainerResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerResolver for ProcfsContainerResolver {
    fn container_context(&self, pid: Pid) -> Result<ContainerContext, LookupError> {
        let Some(cgroup) = procfs::get_process_cgroup(pid)? else {
            return Ok(ContainerContext::default());
        };
        let mut context = ContainerContext {
            container_id: container_id_from_cgroup(&cgroup)
                .map(|id| id.to_string())
                .unwrap_or_default(),
            cgroup: CgroupContext {
                id: cgroup.clone(),
                ..Default::default()
            },
        };
        if let Some(mountpoint) = &self.cgroup2_mountpoint {
            let dir = Path::new(mountpoint).join(cgroup.trim_start_matches('/'));
            if let Ok(metadata) = fs::metadata(&dir) {
                context.cgroup.file_inode = metadata.ino();
            }
        }
        Ok(context)
    }
}

pub struct ProcfsMountResolver;

impl MountResolver for ProcfsMountResolver {
    fn filesystem(&self, pid: Pid, mount_id: u32) -> Result<String, LookupError> {
        match mountinfo::get_process_mount(pid, mount_id) {
            Ok(mount) => Ok(mount.fs_type),
            // the process may be gone, its mount namespace view with it
            Err(MountinfoError::Process { .. }) => Ok(mountinfo::get_process_mount(
                Pid::this(),
                mount_id,
            )?
            .fs_type),
            Err(err) => Err(err.into()),
        }
    }
}

/// Resolves the executable of a live process through `/proc/<pid>/exe`,
/// accepting it only if the inode still matches.
pub struct ProcfsPathResolver;

impl PathResolver for ProcfsPathResolver {
    fn resolve(
        &self,
        fields: &FileFields,
        pid: Pid,
        _container_id: &str,
    ) -> Result<ResolvedPath, LookupError> {
        if fields.inode == 0 {
            return Err(LookupError::InvalidKey {
                inode: fields.inode,
                mount_id: fields.mount_id,
            });
        }
        let image = procfs::get_process_image(pid)?;
        let path = image.to_string_lossy().into_owned();
        let exe = format!("/proc/{pid}/exe");
        let found = fs::metadata(&exe)
            .map_err(|source| procfs::ProcfsError::ReadFile { source, path: exe })?
            .ino();
        if found != fields.inode {
            return Err(LookupError::InodeMismatch {
                path,
                expected: fields.inode,
                found,
            });
        }
        let mount_path = if fields.mount_id != 0 {
            mountinfo::get_process_mount(pid, fields.mount_id)
                .map(|mount| mount.mount_point.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            String::new()
        };
        Ok(ResolvedPath {
            path,
            mount_path,
            origin: PathOrigin::Procfs,
        })
    }
}

pub struct ProcfsEnvVarsResolver {
    pub max_envs: usize,
}

impl EnvVarsResolver for ProcfsEnvVarsResolver {
    fn env_vars(&self, pid: Pid) -> Result<(Vec<String>, bool), LookupError> {
        Ok(procfs::get_process_environ(pid, self.max_envs)?)
    }
}

const NAME_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(256) {
    Some(size) => size,
    None => unreachable!(),
};

/// Host user database lookups, cached. Container specific databases are not read.
pub struct SystemUserGroupResolver {
    users: Mutex<LruCache<u32, Option<String>>>,
    groups: Mutex<LruCache<u32, Option<String>>>,
}

impl Default for SystemUserGroupResolver {
    fn default() -> Self {
        Self {
            users: Mutex::new(LruCache::new(NAME_CACHE_SIZE)),
            groups: Mutex::new(LruCache::new(NAME_CACHE_SIZE)),
        }
    }
}

impl UserGroupResolver for SystemUserGroupResolver {
    fn user(&self, uid: u32, _container_id: &str) -> Option<String> {
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        users
            .get_or_insert(uid, || {
                User::from_uid(Uid::from_raw(uid))
                    .ok()
                    .flatten()
                    .map(|user| user.name)
            })
            .clone()
    }

    fn group(&self, gid: u32, _container_id: &str) -> Option<String> {
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        groups
            .get_or_insert(gid, || {
                Group::from_gid(Gid::from_raw(gid))
                    .ok()
                    .flatten()
                    .map(|group| group.name)
            })
            .clone()
    }
}

pub struct BootTimeResolver {
    boot_time: Timestamp,
}

impl BootTimeResolver {
    pub fn new(boot_time: Timestamp) -> Self {
        Self { boot_time }
    }

    pub fn from_procfs() -> Result<Self, LookupError> {
        let secs = procfs::get_boot_time()?;
        Ok(Self::new(Timestamp::from(secs * 1_000_000_000)))
    }
}

impl TimeResolver for BootTimeResolver {
    fn boot_time(&self) -> Timestamp {
        self.boot_time
    }
}
