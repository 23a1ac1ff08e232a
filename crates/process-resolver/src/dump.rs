//! Diagnostic exports of the process table.

use std::{
    collections::HashSet,
    fs::{self, OpenOptions},
    io::{self, BufWriter, Write},
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    time::SystemTime,
};

use bpf_common::time::Timestamp;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::{
    entry::{
        ArgsEnvs, CgroupContext, Credentials, FileEvent, ProcessEntry, SecurityCredential,
        Source, Symlink,
    },
    pool::ProcessRef,
    resolver::ProcessResolver,
};

const DUMP_PREFIX: &str = "process-cache-dump-";

#[derive(Serialize)]
struct Dump {
    entries: Vec<serde_json::Value>,
}

/// One line per process, the fields needed to debug lineage.
#[derive(Serialize)]
struct CompactEntry<'a> {
    pid: i32,
    ppid: i32,
    path: &'a str,
    inode: u64,
    mount_id: u32,
    source: Source,
    exec_inode: u64,
    is_exec: bool,
    is_parent_missing: bool,
    cgroup: &'a str,
    container_id: &'a str,
}

impl<'a> CompactEntry<'a> {
    fn new(entry: &'a ProcessEntry) -> Self {
        Self {
            pid: entry.pid.as_raw(),
            ppid: entry.ppid.as_raw(),
            path: &entry.file.path,
            inode: entry.file.fields.inode,
            mount_id: entry.file.fields.mount_id,
            source: entry.source,
            exec_inode: entry.exec_inode,
            is_exec: entry.is_exec,
            is_parent_missing: entry.is_parent_missing,
            cgroup: &entry.cgroup.id,
            container_id: &entry.container_id,
        }
    }
}

#[derive(Serialize)]
struct FullEntry<'a> {
    pid: i32,
    tid: i32,
    ppid: i32,
    cookie: u64,
    exec_inode: u64,
    fork_time: Option<String>,
    exec_time: Option<String>,
    exit_time: Option<String>,
    comm: &'a str,
    tty_name: &'a str,
    file: &'a FileEvent,
    interpreter: Option<&'a FileEvent>,
    symlink: Option<&'a Symlink>,
    credentials: &'a Credentials,
    args: Option<&'a ArgsEnvs>,
    envs: Option<&'a ArgsEnvs>,
    container_id: &'a str,
    cgroup: &'a CgroupContext,
    security_credentials: &'a [SecurityCredential],
    ancestor: Option<i32>,
    is_parent_missing: bool,
    is_exec: bool,
    is_kworker: bool,
    source: Source,
}

impl<'a> FullEntry<'a> {
    fn new(entry: &'a ProcessEntry) -> Self {
        Self {
            pid: entry.pid.as_raw(),
            tid: entry.tid.as_raw(),
            ppid: entry.ppid.as_raw(),
            cookie: entry.cookie,
            exec_inode: entry.exec_inode,
            fork_time: format_time(entry.fork_time),
            exec_time: format_time(entry.exec_time),
            exit_time: format_time(entry.exit_time),
            comm: &entry.comm,
            tty_name: &entry.tty_name,
            file: &entry.file,
            interpreter: entry.interpreter.as_ref(),
            symlink: entry.symlink.as_ref(),
            credentials: &entry.credentials,
            args: entry.args.as_deref(),
            envs: entry.envs.as_deref(),
            container_id: &entry.container_id,
            cgroup: &entry.cgroup,
            security_credentials: &entry.security_credentials,
            ancestor: entry.ancestor.as_ref().map(|a| a.pid().as_raw()),
            is_parent_missing: entry.is_parent_missing,
            is_exec: entry.is_exec,
            is_kworker: entry.is_kworker,
            source: entry.source,
        }
    }
}

fn format_time(ts: Timestamp) -> Option<String> {
    if ts.is_zero() {
        return None;
    }
    let time: DateTime<Utc> = SystemTime::from(ts).into();
    Some(time.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

impl ProcessResolver {
    /// JSON export of the table. `raw` includes every field, otherwise only
    /// identity and lineage flags.
    pub fn to_json(&self, raw: bool) -> serde_json::Result<String> {
        let table = self.read_table();
        let mut processes: Vec<&ProcessRef> = table.iter().collect();
        processes.sort_by_key(|process| process.pid());
        let mut entries = Vec::with_capacity(processes.len());
        for process in processes {
            let entry = process.read();
            let value = if raw {
                serde_json::to_value(FullEntry::new(&entry))?
            } else {
                serde_json::to_value(CompactEntry::new(&entry))?
            };
            entries.push(value);
        }
        serde_json::to_string(&Dump { entries })
    }

    /// Graphviz export of the lineage of every cached process, written
    /// under the table read lock. Exited processes are bracketed.
    pub fn write_dot<W: Write>(&self, writer: &mut W, with_args: bool) -> io::Result<()> {
        let table = self.read_table();
        let mut processes: Vec<&ProcessRef> = table.iter().collect();
        processes.sort_by_key(|process| process.pid());

        writeln!(writer, "digraph ProcessTree {{")?;
        let mut already = HashSet::new();
        for process in processes {
            let mut current = Some(process.clone());
            while let Some(process) = current {
                let entry = process.read();
                let node = format!("{}:{}", entry.pid, escape(&entry.comm));
                if already.insert(node.clone()) {
                    let mut label = format!("{}:{}", escape(&entry.comm), entry.pid);
                    if entry.has_exited() {
                        label = format!("[{label}]");
                    }
                    if with_args {
                        let args = escape(&entry.args_values().join(" "));
                        writeln!(writer, r#""{node}" [label="{label}", comment="{args}"];"#)?;
                    } else {
                        writeln!(writer, r#""{node}" [label="{label}"];"#)?;
                    }
                }
                if let Some(ancestor) = &entry.ancestor {
                    let parent = ancestor.read();
                    let relation = format!(
                        r#""{}:{}" -> "{node}";"#,
                        parent.pid,
                        escape(&parent.comm)
                    );
                    if already.insert(relation.clone()) {
                        writeln!(writer, "{relation}")?;
                    }
                }
                current = entry.ancestor.clone();
            }
        }
        write!(writer, "}}")
    }

    /// Write the graph to a new read-only file in the temporary directory
    /// and return its path.
    pub fn to_dot(&self, with_args: bool) -> io::Result<PathBuf> {
        let path = std::env::temp_dir().join(format!("{DUMP_PREFIX}{:016x}", rand::random::<u64>()));
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o400))?;
        let mut writer = BufWriter::new(file);
        self.write_dot(&mut writer, with_args)?;
        writer.flush()?;
        Ok(path)
    }
}
