//! The process cache: resolution pipeline and fork/exec/exit lifecycle.
//!
//! Lookups try, in order, the in-memory table, the kernel maps filled by the
//! probes, and finally procfs. Every mutation of the table happens under its
//! write lock, including the slow procfs path, so that ancestor resolution
//! always sees a consistent table.

use std::{
    collections::HashSet,
    num::NonZeroUsize,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU8, Ordering},
    },
};

use bpf_common::{
    Pid, log_error,
    parsing::{containers::container_id_from_cgroup, procfs},
    time::Timestamp,
};

use crate::{
    args_envs::ArgsEnvsCache,
    config::ResolverConfig,
    entry::{
        CgroupContext, FileEvent, FileFields, ProcessEntry, SecurityCredential, Source, Symlink,
    },
    error::{ExecError, LookupError, ResolverError},
    kernel_maps::KernelMaps,
    limiter::Limiter,
    pool::{EntryPool, ProcessRef},
    record::{PidRecord, ProcRecord},
    resolvers::{ResolvedPath, Resolvers},
    stats::{HitSource, MetricsSink, Stats, StatsReport},
    table::{ProcessTable, QueueReason},
};

/// Attempts at resolving an executable path: the process itself, then its
/// parent and grandparent, which may still see the same mount namespace.
const PATH_RESOLUTION_ATTEMPTS: usize = 3;

const BUSYBOX_PATHS: [&str; 2] = ["/bin/busybox", "/usr/bin/busybox"];

/// Progress of the initial procfs snapshot. Fallbacks are only attempted once
/// the table has been populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Snapshotting,
    Snapshotted,
}

impl SnapshotState {
    fn from_raw(value: u8) -> Self {
        match value {
            0 => SnapshotState::Snapshotting,
            _ => SnapshotState::Snapshotted,
        }
    }

    fn raw(self) -> u8 {
        match self {
            SnapshotState::Snapshotting => 0,
            SnapshotState::Snapshotted => 1,
        }
    }
}

/// An entry inserted as a side effect of a call. `error` is set when the
/// entry could not be completed, in which case it was not cached.
#[derive(Debug)]
pub struct NewEntry {
    pub process: ProcessRef,
    pub error: Option<ResolverError>,
}

/// Result of a resolution: the entry, where it was found, and every entry
/// created along the way, ancestors included, in insertion order.
#[derive(Debug, Default)]
pub struct Resolution {
    pub process: Option<ProcessRef>,
    pub source: Option<HitSource>,
    pub created: Vec<NewEntry>,
}

impl Resolution {
    fn hit(process: ProcessRef, source: HitSource, created: Vec<NewEntry>) -> Self {
        Self {
            process: Some(process),
            source: Some(source),
            created,
        }
    }

    fn miss(created: Vec<NewEntry>) -> Self {
        Self {
            process: None,
            source: None,
            created,
        }
    }
}

/// Credential changes observed on a running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialsChange {
    SetUid { uid: u32, euid: u32, fsuid: u32 },
    SetGid { gid: u32, egid: u32, fsgid: u32 },
    Capset { effective: u64, permitted: u64 },
    LoginUid(u32),
}

pub struct ProcessResolver {
    pub(crate) config: ResolverConfig,
    pub(crate) table: RwLock<ProcessTable>,
    state: AtomicU8,
    pub(crate) pool: EntryPool,
    args_envs: Mutex<ArgsEnvsCache>,
    limiter: Mutex<Limiter<Pid>>,
    pub(crate) maps: Arc<dyn KernelMaps>,
    pub(crate) resolvers: Resolvers,
    pub(crate) stats: Arc<Stats>,
}

fn non_zero(value: usize) -> NonZeroUsize {
    NonZeroUsize::new(value).unwrap_or(NonZeroUsize::MIN)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessResolver {
    pub fn new(config: ResolverConfig, maps: Arc<dyn KernelMaps>, resolvers: Resolvers) -> Self {
        let stats = Arc::new(Stats::default());
        Self {
            table: RwLock::new(ProcessTable::new(stats.clone())),
            state: AtomicU8::new(SnapshotState::Snapshotting.raw()),
            pool: EntryPool::new(config.pool_capacity, stats.clone()),
            args_envs: Mutex::new(ArgsEnvsCache::new(
                non_zero(config.args_envs_cache_size),
                non_zero(config.interner_size),
                config.max_arg_env_size,
            )),
            limiter: Mutex::new(Limiter::new(
                non_zero(config.fallback_tracked_pids),
                config.fallback_allowed_per_period,
                config.fallback_period,
            )),
            maps,
            resolvers,
            stats,
            config,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub(crate) fn read_table(&self) -> RwLockReadGuard<'_, ProcessTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_table(&self) -> RwLockWriteGuard<'_, ProcessTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_args_envs(&self) -> MutexGuard<'_, ArgsEnvsCache> {
        lock(&self.args_envs)
    }

    pub fn state(&self) -> SnapshotState {
        SnapshotState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SnapshotState) {
        self.state.store(state.raw(), Ordering::Release);
    }

    /// A cleared entry, to be filled by the event decoder and handed to
    /// [`ProcessResolver::on_fork`] or [`ProcessResolver::on_exec`].
    pub fn new_entry(&self, pid: Pid, tid: Pid) -> ProcessEntry {
        let mut entry = self.pool.get();
        entry.pid = pid;
        entry.tid = tid;
        entry
    }

    /// Record a chunk of arguments or environment variables sent by the probes.
    pub fn update_args_envs(&self, id: u32, raw: &[u8]) {
        self.lock_args_envs().update(id, raw);
    }

    /// Resolve the current image of `pid`. `inode`, when non-zero, is the
    /// inode the caller expects the executable to have; an entry with another
    /// inode is considered stale.
    pub fn resolve(&self, pid: Pid, tid: Pid, inode: u64, allow_slow: bool) -> Resolution {
        if pid.as_raw() == 0 {
            return Resolution::default();
        }
        {
            let table = self.read_table();
            if let Some(process) = probe_cache(&table, pid, tid, inode) {
                self.stats.hit(HitSource::Cache);
                return Resolution::hit(process, HitSource::Cache, Vec::new());
            }
        }
        let mut table = self.write_table();
        let mut created = Vec::new();
        match self.resolve_locked(
            &mut table,
            pid,
            tid,
            inode,
            allow_slow,
            self.config.max_resolve_depth,
            &mut created,
        ) {
            Some((process, source)) => Resolution::hit(process, source, created),
            None => Resolution::miss(created),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn resolve_locked(
        &self,
        table: &mut ProcessTable,
        pid: Pid,
        tid: Pid,
        inode: u64,
        allow_slow: bool,
        depth: usize,
        created: &mut Vec<NewEntry>,
    ) -> Option<(ProcessRef, HitSource)> {
        if pid.as_raw() == 0 {
            return None;
        }
        if let Some(process) = probe_cache(table, pid, tid, inode) {
            self.stats.hit(HitSource::Cache);
            return Some((process, HitSource::Cache));
        }
        if self.state() != SnapshotState::Snapshotted || depth == 0 {
            self.stats.miss();
            return None;
        }
        if let Some(process) = self.resolve_from_kernel_maps(table, pid, tid, inode, depth, created) {
            self.stats.hit(HitSource::KernelMaps);
            return Some((process, HitSource::KernelMaps));
        }
        if allow_slow {
            if lock(&self.limiter).allow(pid) {
                self.stats.fallback_attempt();
                if let Some(process) = self.resolve_from_procfs(table, pid, inode, depth, created) {
                    self.stats.hit(HitSource::Procfs);
                    return Some((process, HitSource::Procfs));
                }
            } else {
                log::trace!("procfs fallback for process {pid} throttled");
                self.stats.fallback_throttled();
            }
        }
        self.stats.miss();
        None
    }

    fn resolve_from_kernel_maps(
        &self,
        table: &mut ProcessTable,
        pid: Pid,
        tid: Pid,
        inode: u64,
        depth: usize,
        created: &mut Vec<NewEntry>,
    ) -> Option<ProcessRef> {
        let pid_data = match self.maps.lookup_pid(pid) {
            Ok(data) => data?,
            Err(err) => {
                log_error("kernel map lookup failed", err);
                return None;
            }
        };
        let pid_record = match PidRecord::decode(&pid_data) {
            Ok(record) => record,
            Err(err) => {
                log::debug!("invalid pid record for process {pid}: {err}");
                return None;
            }
        };
        let proc_data = match self.maps.lookup_proc(pid_record.cookie) {
            Ok(data) => data?,
            Err(err) => {
                log_error("kernel map lookup failed", err);
                return None;
            }
        };
        let proc_record = match ProcRecord::decode(&proc_data) {
            Ok(record) => record,
            Err(err) => {
                log::debug!("invalid proc record for process {pid}: {err}");
                return None;
            }
        };
        if inode != 0 && proc_record.file.inode != 0 && proc_record.file.inode != inode {
            log::warn!(
                "kernel map entry of process {pid} has inode {}, expected {inode}",
                proc_record.file.inode
            );
            self.stats.inode_error();
            return None;
        }

        let mut entry = self.new_entry(pid, tid);
        entry.exec_inode = inode;
        self.fill_from_records(&mut entry, pid_record, proc_record);
        // processes started before the probes have no container in the kernel maps
        if entry.cgroup.file_inode == 0 {
            if let Ok(context) = self.resolvers.container.container_context(pid) {
                entry.container_id = context.container_id;
                entry.cgroup = context.cgroup;
            }
        }
        if let Err(err) = self.enrich_exec_entry(table, &mut entry) {
            log::debug!("kernel map entry of process {pid} incomplete: {err}");
            created.push(NewEntry {
                process: self.pool.seal(entry),
                error: Some(err),
            });
            return None;
        }

        let process = if entry.exec_time.is_zero() {
            let inode = entry.file.fields.inode;
            self.insert_fork_entry(table, entry, inode, Source::KernelMap, depth, created)
        } else {
            self.insert_exec_entry(table, entry, 0, Source::KernelMap)
        };
        created.push(NewEntry {
            process: process.clone(),
            error: None,
        });
        Some(process)
    }

    fn fill_from_records(&self, entry: &mut ProcessEntry, pid: PidRecord, proc: ProcRecord) {
        let time = &self.resolvers.time;
        entry.cookie = pid.cookie;
        entry.ppid = Pid::from_raw(pid.ppid as i32);
        entry.fork_time = time.apply_boot_time(pid.fork_ns);
        entry.exit_time = time.apply_boot_time(pid.exit_ns);
        entry.credentials = pid.credentials;
        entry.args_id = pid.args_id;
        entry.envs_id = pid.envs_id;

        entry.container_id = proc.container_id;
        entry.cgroup = CgroupContext {
            id: String::new(),
            flags: proc.cgroup_flags,
            file_inode: proc.cgroup_inode,
            file_mount_id: proc.cgroup_mount_id,
        };
        entry.file = FileEvent::with_fields(proc.file);
        entry.exec_time = time.apply_boot_time(proc.exec_ns);
        entry.tty_name = proc.tty_name;
        entry.comm = proc.comm;
        if proc.interpreter_inode != 0 {
            entry.interpreter = Some(FileEvent::with_fields(FileFields {
                inode: proc.interpreter_inode,
                mount_id: proc.interpreter_mount_id,
                path_id: proc.interpreter_path_id,
                ..Default::default()
            }));
        }
    }

    /// Resolve everything an exec event does not carry: paths, arguments,
    /// environment, tty, user and group names, filesystem.
    fn enrich_exec_entry(
        &self,
        table: &ProcessTable,
        entry: &mut ProcessEntry,
    ) -> Result<(), ResolverError> {
        let (pid, ppid) = (entry.pid, entry.ppid);
        let mut file = std::mem::take(&mut entry.file);
        let result = self.set_process_path(table, &mut file, pid, ppid, &entry.container_id);
        entry.file = file;
        result.map_err(|source| ResolverError::PathResolution {
            what: "exec",
            source,
        })?;

        if let Some(mut interpreter) = entry.interpreter.take() {
            let result =
                self.set_process_path(table, &mut interpreter, pid, ppid, &entry.container_id);
            entry.interpreter = Some(interpreter);
            result.map_err(|source| ResolverError::PathResolution {
                what: "interpreter",
                source,
            })?;
        }

        self.attach_args_envs(entry);
        if entry.tty_name.is_empty() && self.config.tty_fallback {
            if let Some(tty) = procfs::get_process_tty(pid) {
                entry.tty_name = tty;
            }
        }
        self.set_users_groups(entry);
        set_symlink(entry);
        self.set_filesystem(entry)
    }

    fn set_process_path(
        &self,
        table: &ProcessTable,
        file: &mut FileEvent,
        pid: Pid,
        ppid: Pid,
        container_id: &str,
    ) -> Result<(), LookupError> {
        let resolved = if file.fields.inode == 0 {
            Err(LookupError::InvalidKey {
                inode: file.fields.inode,
                mount_id: file.fields.mount_id,
            })
        } else {
            self.resolve_path(table, &file.fields, pid, ppid, container_id)
        };
        match resolved {
            Ok(resolved) => {
                file.set_path(&resolved.path);
                file.mount_path = resolved.mount_path;
                file.origin = resolved.origin;
                Ok(())
            }
            Err(err) => {
                file.path.clear();
                file.basename.clear();
                self.stats.path_error();
                Err(err)
            }
        }
    }

    /// The path is resolved in the context of the process, retrying from its
    /// cached ancestors when the process is already gone.
    fn resolve_path(
        &self,
        table: &ProcessTable,
        fields: &FileFields,
        mut pid: Pid,
        mut ppid: Pid,
        container_id: &str,
    ) -> Result<ResolvedPath, LookupError> {
        let mut attempts = PATH_RESOLUTION_ATTEMPTS;
        loop {
            let err = match self.resolvers.path.resolve(fields, pid, container_id) {
                Ok(resolved) => return Ok(resolved),
                Err(err) => err,
            };
            attempts -= 1;
            match table.get(ppid) {
                Some(parent) if attempts > 0 => {
                    let parent = parent.read();
                    pid = parent.pid;
                    ppid = parent.ppid;
                }
                _ => return Err(err),
            }
        }
    }

    fn attach_args_envs(&self, entry: &mut ProcessEntry) {
        let mut cache = self.lock_args_envs();
        if let Some(args) = cache.consume(entry.args_id) {
            self.stats.args(args.size, args.values.truncated);
            entry.args = Some(Arc::new(args.values));
        }
        if !self.config.envs_resolution {
            return;
        }
        if let Some(envs) = cache.consume(entry.envs_id) {
            self.stats.envs(envs.size, envs.values.truncated);
            entry.envs = Some(Arc::new(envs.values));
        }
    }

    pub(crate) fn set_users_groups(&self, entry: &mut ProcessEntry) {
        let resolver = &self.resolvers.user_group;
        let container_id = entry.container_id.as_str();
        let credentials = &mut entry.credentials;
        credentials.user = resolver.user(credentials.uid, container_id).unwrap_or_default();
        credentials.euser = resolver.user(credentials.euid, container_id).unwrap_or_default();
        credentials.fsuser = resolver.user(credentials.fsuid, container_id).unwrap_or_default();
        credentials.group = resolver.group(credentials.gid, container_id).unwrap_or_default();
        credentials.egroup = resolver.group(credentials.egid, container_id).unwrap_or_default();
        credentials.fsgroup = resolver.group(credentials.fsgid, container_id).unwrap_or_default();
    }

    fn set_filesystem(&self, entry: &mut ProcessEntry) -> Result<(), ResolverError> {
        let mount_id = entry.file.fields.mount_id;
        if mount_id == 0 {
            return Ok(());
        }
        entry.file.filesystem = self
            .resolvers
            .mount
            .filesystem(entry.pid, mount_id)
            .map_err(|source| ResolverError::Filesystem { mount_id, source })?;
        Ok(())
    }

    pub(crate) fn insert_entry(
        &self,
        table: &mut ProcessTable,
        mut entry: ProcessEntry,
        source: Source,
    ) -> ProcessRef {
        entry.source = source;
        log::trace!(
            "new process cache entry {} {} {}/{} from {source}",
            entry.comm,
            entry.file.path,
            entry.pid,
            entry.file.fields.inode
        );
        let process = self.pool.seal(entry);
        table.insert(process.clone());
        self.stats.added(source);
        process
    }

    /// Insert a forked child, linking it to its parent. A parent missing from
    /// the table, or cached with another binary than `parent_inode`, is
    /// resolved through the pipeline first.
    fn insert_fork_entry(
        &self,
        table: &mut ProcessTable,
        mut entry: ProcessEntry,
        parent_inode: u64,
        source: Source,
        depth: usize,
        created: &mut Vec<NewEntry>,
    ) -> ProcessRef {
        if let Some(prev) = table.get(entry.pid) {
            // the pid was reused, the previous process is gone
            prev.write().exit_time = entry.fork_time;
        }
        if entry.pid.as_raw() != 1 {
            let ppid = entry.ppid;
            let mut parent = table.get(ppid).cloned();
            let mismatch = matches!(
                &parent,
                Some(cached) if parent_inode != 0 && cached.read().file.fields.inode != parent_inode
            );
            if (parent.is_none() || mismatch) && ppid.as_raw() >= 1 {
                match self.resolve_locked(
                    table,
                    ppid,
                    ppid,
                    parent_inode,
                    true,
                    depth.saturating_sub(1),
                    created,
                ) {
                    Some((candidate, _)) => parent = Some(candidate),
                    None => {
                        entry.is_parent_missing = true;
                        if mismatch {
                            self.stats.inode_error();
                        }
                    }
                }
            }
            match parent {
                Some(parent) => {
                    let guard = parent.read();
                    entry.inherit_from_parent(&guard, parent.clone());
                }
                None => entry.is_parent_missing = true,
            }
        }
        if entry.is_parent_missing {
            self.stats.broken_lineage();
        }
        self.insert_entry(table, entry, source)
    }

    /// Insert a new image of a process. An exec identical to the cached one
    /// only refreshes its exec time and returns the cached entry.
    fn insert_exec_entry(
        &self,
        table: &mut ProcessTable,
        mut entry: ProcessEntry,
        inode: u64,
        source: Source,
    ) -> ProcessRef {
        match table.get(entry.pid).cloned() {
            Some(prev) => {
                let mut prev_entry = prev.write();
                if inode != 0 && prev_entry.file.fields.inode != inode {
                    entry.is_parent_missing = true;
                    self.stats.inode_error();
                }
                if prev_entry.same_image_as(&entry) {
                    prev_entry.exec_time = entry.exec_time;
                    drop(prev_entry);
                    self.pool.recycle(entry);
                    return prev;
                }
                // the replaced image ends with the exec
                prev_entry.exit_time = entry.exec_time;
                entry.inherit_from_predecessor(&prev_entry, prev.clone());
            }
            None => entry.is_parent_missing = true,
        }
        if entry.is_parent_missing {
            self.stats.broken_lineage();
        }
        entry.exec_inode = entry.file.fields.inode;
        self.insert_entry(table, entry, source)
    }

    /// Handle a fork event. The returned resolution holds the new entry; its
    /// `created` list also names ancestors resolved on the way.
    pub fn on_fork(&self, entry: ProcessEntry) -> Result<Resolution, ResolverError> {
        let pid = entry.pid;
        if pid.as_raw() == 0 {
            self.pool.recycle(entry);
            return Err(ResolverError::NoPid(pid));
        }
        if procfs::is_kernel_thread(pid, entry.ppid) {
            self.pool.recycle(entry);
            return Err(ResolverError::KernelThread(pid));
        }
        let parent_inode = entry.exec_inode;
        let mut table = self.write_table();
        let mut created = Vec::new();
        let process = self.insert_fork_entry(
            &mut table,
            entry,
            parent_inode,
            Source::Event,
            self.config.max_resolve_depth,
            &mut created,
        );
        created.push(NewEntry {
            process: process.clone(),
            error: None,
        });
        Ok(Resolution {
            process: Some(process),
            source: None,
            created,
        })
    }

    /// Handle an exec event. `entry.exec_inode` is the inode of the image
    /// being replaced. On failure the entry is not cached but handed back in
    /// the error, so that the event can still be reported.
    pub fn on_exec(&self, mut entry: ProcessEntry) -> Result<ProcessRef, ExecError> {
        let pid = entry.pid;
        if pid.as_raw() == 0 {
            self.pool.recycle(entry);
            return Err(ExecError {
                pid,
                entry: None,
                source: ResolverError::NoPid(pid),
            });
        }
        let mut table = self.write_table();
        if let Err(source) = self.enrich_exec_entry(&table, &mut entry) {
            entry.source = Source::Event;
            return Err(ExecError {
                pid,
                entry: Some(self.pool.seal(entry)),
                source,
            });
        }
        let inode = entry.exec_inode;
        Ok(self.insert_exec_entry(&mut table, entry, inode, Source::Event))
    }

    /// Handle an exit event. The entry stays cached for the retention window
    /// so that late events of the process still resolve.
    pub fn on_exit(&self, pid: Pid, tid: Pid, inode: u64, exit_time: Timestamp) -> Resolution {
        if pid.as_raw() == 0 {
            return Resolution::default();
        }
        let mut table = self.write_table();
        let mut created = Vec::new();
        let found = self.resolve_locked(
            &mut table,
            pid,
            tid,
            inode,
            false,
            self.config.max_resolve_depth,
            &mut created,
        );
        let Some((process, source)) = found else {
            return Resolution::miss(created);
        };
        process.write().exit_time = if exit_time.is_zero() {
            Timestamp::now()
        } else {
            exit_time
        };
        table.enqueue(pid, QueueReason::Exited);
        Resolution::hit(process, source, created)
    }

    /// Apply a credential change. Changes made by threads other than the
    /// leader are ignored. Returns whether a cached entry was updated.
    pub fn update_credentials(&self, pid: Pid, tid: Pid, change: CredentialsChange) -> bool {
        if pid != tid {
            return false;
        }
        let table = self.write_table();
        let Some(process) = table.get(pid) else {
            return false;
        };
        let mut entry = process.write();
        let resolver = &self.resolvers.user_group;
        let container_id = entry.container_id.clone();
        let credentials = &mut entry.credentials;
        match change {
            CredentialsChange::SetUid { uid, euid, fsuid } => {
                credentials.uid = uid;
                credentials.euid = euid;
                credentials.fsuid = fsuid;
                credentials.user = resolver.user(uid, &container_id).unwrap_or_default();
                credentials.euser = resolver.user(euid, &container_id).unwrap_or_default();
                credentials.fsuser = resolver.user(fsuid, &container_id).unwrap_or_default();
            }
            CredentialsChange::SetGid { gid, egid, fsgid } => {
                credentials.gid = gid;
                credentials.egid = egid;
                credentials.fsgid = fsgid;
                credentials.group = resolver.group(gid, &container_id).unwrap_or_default();
                credentials.egroup = resolver.group(egid, &container_id).unwrap_or_default();
                credentials.fsgroup = resolver.group(fsgid, &container_id).unwrap_or_default();
            }
            CredentialsChange::Capset {
                effective,
                permitted,
            } => {
                credentials.cap_effective = effective;
                credentials.cap_permitted = permitted;
            }
            CredentialsChange::LoginUid(auid) => credentials.auid = auid,
        }
        true
    }

    /// Attach a credential seen in use by the process, once per access key.
    pub fn add_security_credentials(&self, pid: Pid, credential: SecurityCredential) -> bool {
        if credential.access_key_id.is_empty() {
            return false;
        }
        let table = self.write_table();
        let Some(process) = table.get(pid) else {
            return false;
        };
        let mut entry = process.write();
        let known = entry
            .security_credentials
            .iter()
            .any(|c| c.access_key_id == credential.access_key_id);
        if !known {
            entry.security_credentials.push(credential);
        }
        true
    }

    /// Credentials of the process still valid at `now`. Expired ones are dropped.
    pub fn fetch_security_credentials(&self, pid: Pid, now: Timestamp) -> Vec<SecurityCredential> {
        let table = self.read_table();
        let Some(process) = table.get(pid) else {
            return Vec::new();
        };
        let mut entry = process.write();
        entry.security_credentials.retain(|c| c.expiration >= now);
        entry.security_credentials.clone()
    }

    /// Replace the cgroup of a process. The container id is derived from the
    /// cgroup path unless systemd manages the cgroup.
    pub fn update_cgroup_context(&self, pid: Pid, cgroup: CgroupContext) -> bool {
        let mut table = self.write_table();
        let mut created = Vec::new();
        let found = self.resolve_locked(
            &mut table,
            pid,
            pid,
            0,
            false,
            self.config.max_resolve_depth,
            &mut created,
        );
        let Some((process, _)) = found else {
            return false;
        };
        let mut entry = process.write();
        if !cgroup.is_systemd() && !cgroup.id.is_empty() {
            entry.container_id = container_id_from_cgroup(&cgroup.id)
                .map(|id| id.to_string())
                .unwrap_or_default();
        }
        entry.cgroup = cgroup;
        true
    }

    pub fn get(&self, pid: Pid) -> Option<ProcessRef> {
        self.read_table().get(pid).cloned()
    }

    /// Visit every cached entry under the read lock.
    pub fn walk<F: FnMut(&ProcessRef)>(&self, mut f: F) {
        let table = self.read_table();
        for process in table.iter() {
            f(process);
        }
    }

    pub fn len(&self) -> usize {
        self.read_table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_table().is_empty()
    }

    /// Remove a process right away.
    pub fn delete_entry(&self, pid: Pid, exit_time: Timestamp) {
        let removed = self.write_table().remove(pid);
        if let Some(process) = removed {
            process.write().exit_time = exit_time;
        }
    }

    /// Delete the exited entries whose retention window elapsed.
    pub fn dequeue_exited(&self) -> usize {
        self.dequeue_exited_at(Timestamp::now())
    }

    pub fn dequeue_exited_at(&self, now: Timestamp) -> usize {
        self.write_table()
            .dequeue_exited(now, self.config.exit_retention)
    }

    /// Reconcile the table with the set of running pids: entries of processes
    /// no longer running are deleted, along with due exited entries.
    pub fn gc_sweep(&self, live: &HashSet<Pid>) -> usize {
        let mut table = self.write_table();
        let absent: Vec<Pid> = table.pids().filter(|pid| !live.contains(pid)).collect();
        for pid in absent {
            table.enqueue(pid, QueueReason::Absent);
        }
        table.dequeue_exited(Timestamp::now(), self.config.exit_retention)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Counters since the previous report.
    pub fn report(&self) -> StatsReport {
        let table_size = self.len();
        self.stats.drain(table_size)
    }

    pub fn send_stats(&self, sink: &dyn MetricsSink) -> anyhow::Result<()> {
        sink.send(&self.report())
    }
}

fn probe_cache(table: &ProcessTable, pid: Pid, tid: Pid, inode: u64) -> Option<ProcessRef> {
    let process = table.get(pid)?;
    {
        let mut entry = process.write();
        if inode != 0 && entry.file.fields.inode != inode {
            return None;
        }
        if tid.as_raw() != 0 {
            entry.tid = tid;
        }
    }
    Some(process.clone())
}

/// Busybox applets are reported under the path of busybox itself. Record
/// the aliases they were most likely started from.
fn set_symlink(entry: &mut ProcessEntry) {
    if !BUSYBOX_PATHS.contains(&entry.file.path.as_str()) {
        return;
    }
    let Some(arg0) = entry.args_values().first() else {
        return;
    };
    let basename = arg0.rsplit('/').next().unwrap_or_default().to_owned();
    entry.symlink = Some(Symlink {
        paths: [format!("/bin/{basename}"), format!("/usr/bin/{basename}")],
        basename,
    });
}
