//! The slow path: building entries from procfs, and writing them back to the
//! kernel maps so that the probes know about processes started before them.

use std::{
    collections::HashMap,
    fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use bpf_common::{
    Pid, log_error,
    parsing::procfs::{self, ProcessStat, ProcessStatus, ProcfsError},
    time::Timestamp,
};

use crate::{
    entry::{FileEvent, FileFields, PathOrigin, ProcessEntry, Source},
    error::{LookupError, ResolverError},
    pool::ProcessRef,
    record::{PidRecord, ProcRecord, decode_file_fields_record, encode_file_fields_record},
    resolver::{NewEntry, ProcessResolver, SnapshotState},
    table::ProcessTable,
};

const DELETED_ROOT: &str = "/ (deleted)";
const FILELESS_FILESYSTEM: &str = "tmpfs";

/// What procfs tells about a process.
#[derive(Debug, Clone)]
pub(crate) struct ProcSnapshot {
    pub pid: Pid,
    pub stat: ProcessStat,
    pub status: ProcessStatus,
    pub cmdline: Vec<String>,
    pub create_time: Timestamp,
}

impl ProcSnapshot {
    pub(crate) fn read(pid: Pid, boot_time: Timestamp) -> Result<Self, ProcfsError> {
        let stat = procfs::get_process_stat(pid)?;
        let status = procfs::get_process_status(pid)?;
        let cmdline = procfs::get_process_command_line(pid)?;
        let create_time = boot_time + procfs::ticks_to_nanos(stat.start_time);
        Ok(Self {
            pid,
            stat,
            status,
            cmdline,
            create_time,
        })
    }

    pub(crate) fn ppid(&self) -> Pid {
        self.stat.ppid
    }

    fn is_kernel_thread(&self) -> bool {
        procfs::is_kernel_thread(self.pid, self.ppid())
    }
}

/// Order processes so that parents come before their children, starting
/// from the children of pid 0. Processes not reachable that way come last.
fn parent_first(processes: &HashMap<Pid, ProcSnapshot>) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for snapshot in processes.values() {
        children.entry(snapshot.ppid()).or_default().push(snapshot.pid);
    }
    for pids in children.values_mut() {
        pids.sort();
    }

    fn add_process_and_children(
        pid: Pid,
        children: &mut HashMap<Pid, Vec<Pid>>,
        sorted: &mut Vec<Pid>,
    ) {
        for child in children.remove(&pid).unwrap_or_default() {
            sorted.push(child);
            add_process_and_children(child, children, sorted);
        }
    }

    let mut sorted = Vec::with_capacity(processes.len());
    add_process_and_children(Pid::from_raw(0), &mut children, &mut sorted);
    if !children.is_empty() {
        let mut orphans: Vec<Pid> = children.into_values().flatten().collect();
        orphans.sort();
        log::debug!("processes not starting from root: {orphans:?}");
        sorted.extend(orphans);
    }
    sorted
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

/// An interpreted script started by path reports the script as its name,
/// with the interpreter as first argument: `python3 ./run.py`.
fn is_interpreted(cmdline: &[String], comm: &str) -> bool {
    match cmdline {
        [first, .., last] => basename(last) == comm && is_absolute(first),
        _ => false,
    }
}

/// The executable of a process, unless it was deleted from under it.
fn executable_path(pid: Pid, image: PathBuf) -> Result<String, ResolverError> {
    let path = image.to_string_lossy().into_owned();
    if path == DELETED_ROOT {
        return Err(ResolverError::PathResolution {
            what: "exec",
            source: LookupError::NotFound {
                what: format!("executable of process {pid}"),
            },
        });
    }
    Ok(path)
}

impl ProcessResolver {
    /// Populate the table from procfs, write the entries back to the kernel
    /// maps, and enable the fallbacks. Returns the number of entries created.
    pub fn snapshot(&self) -> Result<usize, ResolverError> {
        let boot_time = self.resolvers.time.boot_time();
        let mut processes = HashMap::new();
        for pid in procfs::get_running_processes().map_err(ResolverError::Snapshot)? {
            match ProcSnapshot::read(pid, boot_time) {
                Ok(snapshot) if snapshot.is_kernel_thread() => {}
                Ok(snapshot) => {
                    processes.insert(pid, snapshot);
                }
                Err(err) => log::trace!("process {pid} not snapshotted: {err}"),
            }
        }

        let mut count = 0;
        {
            let mut table = self.write_table();
            let mut created = Vec::new();
            for pid in parent_first(&processes) {
                let Some(snapshot) = processes.get(&pid) else {
                    continue;
                };
                if let Some(process) = self.new_entry_from_procfs(
                    &mut table,
                    snapshot,
                    0,
                    Source::Snapshot,
                    &mut created,
                ) {
                    self.sync_kernel_maps(&process);
                    count += 1;
                }
            }
        }
        self.set_state(SnapshotState::Snapshotted);
        log::debug!("process cache populated with {count} entries");
        Ok(count)
    }

    /// Refresh a single process from procfs, kernel maps included.
    pub fn sync_cache(&self, pid: Pid) -> Option<ProcessRef> {
        let boot_time = self.resolvers.time.boot_time();
        let snapshot = match ProcSnapshot::read(pid, boot_time) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                log::trace!("process {pid} not synced: {err}");
                return None;
            }
        };
        let mut table = self.write_table();
        let mut created = Vec::new();
        let process =
            self.new_entry_from_procfs(&mut table, &snapshot, 0, Source::Snapshot, &mut created)?;
        self.sync_kernel_maps(&process);
        Some(process)
    }

    pub(crate) fn resolve_from_procfs(
        &self,
        table: &mut ProcessTable,
        pid: Pid,
        inode: u64,
        depth: usize,
        created: &mut Vec<NewEntry>,
    ) -> Option<ProcessRef> {
        if depth == 0 {
            log::trace!("max depth reached during procfs resolution of {pid}");
            return None;
        }
        if pid.as_raw() == 0 {
            return None;
        }
        let snapshot = match ProcSnapshot::read(pid, self.resolvers.time.boot_time()) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                log::trace!("process {pid} not found in procfs: {err}");
                return None;
            }
        };
        if snapshot.is_kernel_thread() {
            return None;
        }
        let ppid = snapshot.ppid();
        if ppid.as_raw() != 0 && table.get(ppid).is_none() {
            // the inode describes this process, not its parent
            self.resolve_from_procfs(table, ppid, 0, depth - 1, created);
        }
        self.new_entry_from_procfs(table, &snapshot, inode, Source::Procfs, created)
    }

    fn new_entry_from_procfs(
        &self,
        table: &mut ProcessTable,
        snapshot: &ProcSnapshot,
        inode: u64,
        source: Source,
        created: &mut Vec<NewEntry>,
    ) -> Option<ProcessRef> {
        let pid = snapshot.pid;
        let mut entry = self.new_entry(pid, pid);
        if let Err(err) = self.enrich_from_procfs(&mut entry, snapshot) {
            log::trace!("process {pid} not resolved from procfs: {err}");
            self.pool.recycle(entry);
            return None;
        }
        if inode != 0 && entry.file.fields.inode != inode {
            log::warn!(
                "inode mismatch for process {pid}, using {inode} instead of {}",
                entry.file.fields.inode
            );
            entry.file.fields.inode = inode;
            entry.is_parent_missing = true;
        }
        entry.exec_inode = entry.file.fields.inode;
        entry.is_kworker = entry.ppid.as_raw() == 0 && pid.as_raw() != 1;

        match table.get(entry.ppid).cloned() {
            Some(parent) => {
                let parent_entry = parent.read();
                if parent_entry.same_binary_as(&entry) {
                    entry.ancestor = Some(parent.clone());
                    entry.is_exec = false;
                } else if let Some(prev) = table.get(pid) {
                    entry.ancestor = Some(prev.clone());
                    entry.is_exec = true;
                } else {
                    entry.ancestor = Some(parent.clone());
                    entry.is_exec = true;
                }
            }
            None if pid.as_raw() == 1 => entry.is_exec = true,
            None => {
                log::debug!("parent {} of process {pid} not cached", entry.ppid);
                entry.is_parent_missing = true;
                self.stats.broken_lineage();
            }
        }

        let process = self.insert_entry(table, entry, source);
        created.push(NewEntry {
            process: process.clone(),
            error: None,
        });
        Some(process)
    }

    fn enrich_from_procfs(
        &self,
        entry: &mut ProcessEntry,
        snapshot: &ProcSnapshot,
    ) -> Result<(), ResolverError> {
        let pid = snapshot.pid;
        // kernel threads have no address space
        if snapshot.stat.vsize == 0 {
            return Err(ResolverError::KernelThread(pid));
        }
        let image = procfs::get_process_image(pid)
            .map_err(|source| ResolverError::Procfs { pid, source })?;
        let path = executable_path(pid, image)?;
        let exe = format!("/proc/{pid}/exe");
        let fields = self.retrieve_file_fields(pid, Path::new(&exe))?;

        match self.resolvers.container.container_context(pid) {
            Ok(context) => {
                entry.container_id = context.container_id;
                entry.cgroup = context.cgroup;
            }
            Err(err) => log::warn!("container context of process {pid} unavailable: {err}"),
        }

        entry.file = FileEvent::with_fields(fields);
        entry.file.set_path(&path);
        entry.file.origin = PathOrigin::Procfs;
        if entry.file.is_fileless() {
            entry.file.filesystem = FILELESS_FILESYSTEM.to_owned();
        } else {
            match self.resolvers.mount.filesystem(pid, fields.mount_id) {
                Ok(filesystem) => entry.file.filesystem = filesystem,
                Err(err) => log::debug!(
                    "filesystem of mount {} for process {pid} unavailable: {err}",
                    fields.mount_id
                ),
            }
        }

        entry.fork_time = snapshot.create_time;
        entry.exec_time = snapshot.create_time;
        entry.comm.clone_from(&snapshot.status.name);
        entry.ppid = snapshot.ppid();
        entry.cookie = rand::random();
        if self.config.tty_fallback {
            entry.tty_name = procfs::get_process_tty(pid).unwrap_or_default();
        }

        let status = &snapshot.status;
        let credentials = &mut entry.credentials;
        credentials.uid = status.uids[0];
        credentials.euid = status.uids[1];
        credentials.fsuid = status.uids[3];
        credentials.gid = status.gids[0];
        credentials.egid = status.gids[1];
        credentials.fsgid = status.gids[3];
        credentials.auid = procfs::get_process_login_uid(pid).unwrap_or_else(|err| {
            log::debug!("login uid of process {pid} unavailable: {err}");
            u32::MAX
        });
        credentials.cap_effective = status.cap_effective;
        credentials.cap_permitted = status.cap_permitted;
        self.set_users_groups(entry);

        {
            let mut cache = self.lock_args_envs();
            entry.args = Some(Arc::new(cache.intern_all(&snapshot.cmdline, false)));
            if self.config.envs_resolution {
                match self.resolvers.env_vars.env_vars(pid) {
                    Ok((envs, truncated)) => {
                        entry.envs = Some(Arc::new(cache.intern_all(&envs, truncated)));
                    }
                    Err(err) => log::debug!("environment of process {pid} unavailable: {err}"),
                }
            }
        }

        if is_interpreted(&snapshot.cmdline, &entry.comm) {
            entry.interpreter = Some(entry.file.clone());
        }
        Ok(())
    }

    /// Kernel attributes of a file. The probes fill the `inode_file` map for
    /// inodes registered there when the file is stat-ed.
    fn retrieve_file_fields(&self, pid: Pid, path: &Path) -> Result<FileFields, ResolverError> {
        let stat = |path: &Path| {
            fs::metadata(path).map_err(|source| ResolverError::Procfs {
                pid,
                source: ProcfsError::ReadFile {
                    source,
                    path: path.display().to_string(),
                },
            })
        };
        let metadata = stat(path)?;
        let inode = metadata.ino();
        let request = FileFields {
            inode,
            device: metadata.dev() as u32,
            uid: metadata.uid(),
            gid: metadata.gid(),
            nlink: metadata.nlink() as u32,
            mode: metadata.mode() as u16,
            ctime: metadata.ctime() as u64,
            mtime: metadata.mtime() as u64,
            ..Default::default()
        };
        self.maps
            .put_inode_file(inode, encode_file_fields_record(&request))?;
        stat(path)?;

        let data = self.maps.lookup_inode_file(inode);
        if let Err(err) = self.maps.delete_inode_file(inode) {
            log_error("freeing inode_file slot failed", err);
        }
        let data = data?.ok_or_else(|| ResolverError::PathResolution {
            what: "exec",
            source: LookupError::NotFound {
                what: format!("inode {inode}"),
            },
        })?;
        let fields = decode_file_fields_record(&data)?;
        if fields.inode == 0 {
            return Err(ResolverError::PathResolution {
                what: "exec",
                source: LookupError::NotFound {
                    what: format!("inode {inode}"),
                },
            });
        }
        Ok(fields)
    }

    /// Publish an entry to the kernel maps.
    pub(crate) fn sync_kernel_maps(&self, process: &ProcessRef) {
        let entry = process.read();
        let time = &self.resolvers.time;
        let interpreter = entry.interpreter.as_ref().map(|file| file.fields);
        let proc_record = ProcRecord {
            container_id: entry.container_id.clone(),
            cgroup_flags: entry.cgroup.flags,
            cgroup_inode: entry.cgroup.file_inode,
            cgroup_mount_id: entry.cgroup.file_mount_id,
            file: entry.file.fields,
            exec_ns: time.since_boot(entry.exec_time),
            tty_name: entry.tty_name.clone(),
            comm: entry.comm.clone(),
            interpreter_inode: interpreter.map(|f| f.inode).unwrap_or_default(),
            interpreter_mount_id: interpreter.map(|f| f.mount_id).unwrap_or_default(),
            interpreter_path_id: interpreter.map(|f| f.path_id).unwrap_or_default(),
        };
        if let Err(err) = self.maps.put_proc(entry.cookie, proc_record.encode()) {
            log_error("couldn't push proc_cache entry to kernel space", err);
        }
        let pid_record = PidRecord {
            cookie: entry.cookie,
            ppid: entry.ppid.as_raw() as u32,
            fork_ns: time.since_boot(entry.fork_time),
            exit_ns: time.since_boot(entry.exit_time),
            credentials: entry.credentials.clone(),
            args_id: entry.args_id,
            envs_id: entry.envs_id,
        };
        if let Err(err) = self.maps.put_pid(entry.pid, pid_record.encode()) {
            log_error("couldn't push pid_cache entry to kernel space", err);
        }
    }
}
