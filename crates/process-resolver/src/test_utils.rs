//! In-memory resolvers and event builders for tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use bpf_common::{Pid, time::Timestamp};

use crate::{
    config::ResolverConfig,
    entry::{FileEvent, FileFields, PathOrigin, ProcessEntry},
    error::LookupError,
    kernel_maps::MemoryKernelMaps,
    resolver::ProcessResolver,
    resolvers::{
        ContainerContext, ContainerResolver, EnvVarsResolver, MountResolver, PathResolver,
        ResolvedPath, Resolvers, TimeResolver, UserGroupResolver,
    },
};

/// Boot time used by [`FixedTimeResolver::default`], in nanoseconds.
pub const BOOT_TIME_NS: u64 = 1_600_000_000_000_000_000;

/// Mount id given to files built by [`exec_event`].
pub const MOUNT_ID: u32 = 21;

fn not_found(what: String) -> LookupError {
    LookupError::NotFound { what }
}

/// Paths by inode. Unknown inodes fail to resolve.
#[derive(Default)]
pub struct MockPathResolver {
    paths: Mutex<HashMap<u64, String>>,
}

impl MockPathResolver {
    pub fn insert(&self, inode: u64, path: &str) {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(inode, path.to_owned());
    }
}

impl PathResolver for MockPathResolver {
    fn resolve(
        &self,
        fields: &FileFields,
        _pid: Pid,
        _container_id: &str,
    ) -> Result<ResolvedPath, LookupError> {
        let paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        let path = paths
            .get(&fields.inode)
            .ok_or_else(|| not_found(format!("inode {}", fields.inode)))?;
        Ok(ResolvedPath {
            path: path.clone(),
            mount_path: "/".to_owned(),
            origin: PathOrigin::Kernel,
        })
    }
}

/// Container contexts by pid, processes without one are on the host.
#[derive(Default)]
pub struct MockContainerResolver {
    contexts: Mutex<HashMap<Pid, ContainerContext>>,
}

impl MockContainerResolver {
    pub fn insert(&self, pid: Pid, context: ContainerContext) {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, context);
    }
}

impl ContainerResolver for MockContainerResolver {
    fn container_context(&self, pid: Pid) -> Result<ContainerContext, LookupError> {
        let contexts = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(contexts.get(&pid).cloned().unwrap_or_default())
    }
}

/// Every mount is `ext4`, except the ones registered as failing.
#[derive(Default)]
pub struct MockMountResolver {
    failing: Mutex<Vec<u32>>,
}

impl MockMountResolver {
    pub fn fail(&self, mount_id: u32) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(mount_id);
    }
}

impl MountResolver for MockMountResolver {
    fn filesystem(&self, _pid: Pid, mount_id: u32) -> Result<String, LookupError> {
        let failing = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
        if failing.contains(&mount_id) {
            return Err(not_found(format!("mount {mount_id}")));
        }
        Ok("ext4".to_owned())
    }
}

#[derive(Default)]
pub struct MockEnvVarsResolver {
    envs: Mutex<HashMap<Pid, Vec<String>>>,
}

impl MockEnvVarsResolver {
    pub fn insert(&self, pid: Pid, envs: &[&str]) {
        self.envs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, envs.iter().map(|env| env.to_string()).collect());
    }
}

impl EnvVarsResolver for MockEnvVarsResolver {
    fn env_vars(&self, pid: Pid) -> Result<(Vec<String>, bool), LookupError> {
        let envs = self.envs.lock().unwrap_or_else(PoisonError::into_inner);
        let values = envs
            .get(&pid)
            .cloned()
            .ok_or_else(|| not_found(format!("environment of {pid}")))?;
        Ok((values, false))
    }
}

/// `root` for id 0, `user<id>` for everything else.
pub struct MockUserGroupResolver;

impl UserGroupResolver for MockUserGroupResolver {
    fn user(&self, uid: u32, _container_id: &str) -> Option<String> {
        Some(match uid {
            0 => "root".to_owned(),
            uid => format!("user{uid}"),
        })
    }

    fn group(&self, gid: u32, _container_id: &str) -> Option<String> {
        Some(match gid {
            0 => "root".to_owned(),
            gid => format!("group{gid}"),
        })
    }
}

pub struct FixedTimeResolver(pub Timestamp);

impl Default for FixedTimeResolver {
    fn default() -> Self {
        Self(Timestamp::from(BOOT_TIME_NS))
    }
}

impl TimeResolver for FixedTimeResolver {
    fn boot_time(&self) -> Timestamp {
        self.0
    }
}

/// Handles on the mocks plugged into a resolver built by [`resolver_with`].
#[derive(Clone)]
pub struct Mocks {
    pub path: Arc<MockPathResolver>,
    pub container: Arc<MockContainerResolver>,
    pub mount: Arc<MockMountResolver>,
    pub env_vars: Arc<MockEnvVarsResolver>,
    pub time: Arc<FixedTimeResolver>,
    pub maps: Arc<MemoryKernelMaps>,
}

impl Default for Mocks {
    fn default() -> Self {
        Self {
            path: Arc::default(),
            container: Arc::default(),
            mount: Arc::default(),
            env_vars: Arc::default(),
            time: Arc::default(),
            maps: Arc::new(MemoryKernelMaps::new()),
        }
    }
}

impl Mocks {
    pub fn resolvers(&self) -> Resolvers {
        Resolvers {
            container: self.container.clone(),
            mount: self.mount.clone(),
            path: self.path.clone(),
            env_vars: self.env_vars.clone(),
            user_group: Arc::new(MockUserGroupResolver),
            time: self.time.clone(),
        }
    }
}

pub fn resolver_with(config: ResolverConfig) -> (ProcessResolver, Mocks) {
    let mocks = Mocks::default();
    let resolver = ProcessResolver::new(config, mocks.maps.clone(), mocks.resolvers());
    (resolver, mocks)
}

pub fn resolver() -> (ProcessResolver, Mocks) {
    resolver_with(ResolverConfig {
        tty_fallback: false,
        ..Default::default()
    })
}

/// Fork of `pid` from `ppid`. `parent_inode` is the binary the parent is
/// expected to run, zero when unknown.
pub fn fork_event(resolver: &ProcessResolver, pid: i32, ppid: i32, parent_inode: u64) -> ProcessEntry {
    let pid = Pid::from_raw(pid);
    let mut entry = resolver.new_entry(pid, pid);
    entry.ppid = Pid::from_raw(ppid);
    entry.exec_inode = parent_inode;
    entry.fork_time = Timestamp::now();
    entry
}

/// Exec of the binary with `inode` by `pid`, replacing an image backed by
/// `prev_inode`, zero when unknown.
pub fn exec_event(resolver: &ProcessResolver, pid: i32, inode: u64, prev_inode: u64) -> ProcessEntry {
    let pid = Pid::from_raw(pid);
    let mut entry = resolver.new_entry(pid, pid);
    entry.exec_inode = prev_inode;
    entry.exec_time = Timestamp::now();
    entry.file = FileEvent::with_fields(FileFields {
        inode,
        mount_id: MOUNT_ID,
        ..Default::default()
    });
    entry
}
