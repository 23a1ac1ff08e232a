//! Utility functions used to extract data from procfs

use glob::glob;
use nix::unistd::Pid;
use procfs::{ProcError, process::Process};
use std::{fs, io, path::PathBuf};
use thiserror::Error;

/// Pid of `kthreadd`, the parent of every kernel thread.
pub const KTHREADD_PID: i32 = 2;

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading file failed {path}")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },
    #[error("reading {what} of process {pid} failed")]
    Process {
        pid: Pid,
        what: &'static str,
        #[source]
        source: ProcError,
    },
    #[error("reading boot time failed")]
    BootTime(#[source] ProcError),

    #[error("globbing running processes")]
    GlobbingError(#[from] glob::PatternError),
    #[error("unreadable entry")]
    GlobError(#[from] glob::GlobError),
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
}

/// Content of `/proc/<pid>/stat` we care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStat {
    pub comm: String,
    pub state: char,
    pub ppid: Pid,
    pub tty_nr: i32,
    /// Start time in clock ticks since boot.
    pub start_time: u64,
    /// Virtual memory size in bytes, zero for kernel threads.
    pub vsize: u64,
}

/// Content of `/proc/<pid>/status` we care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessStatus {
    pub name: String,
    pub ppid: i32,
    /// Real, effective, saved and filesystem uids.
    pub uids: [u32; 4],
    /// Real, effective, saved and filesystem gids.
    pub gids: [u32; 4],
    pub cap_effective: u64,
    pub cap_permitted: u64,
}

/// Returns the path of the executable image of a given process.
pub fn get_process_image(pid: Pid) -> Result<PathBuf, ProcfsError> {
    read_link(&format!("/proc/{pid}/exe"))
}

/// Return where a link is pointing to.
fn read_link(path: &str) -> Result<PathBuf, ProcfsError> {
    fs::read_link(path).map_err(|source| ProcfsError::ReadFile {
        source,
        path: path.to_string(),
    })
}

/// Convenience type for command lines.
pub type CommandLine = Vec<String>;

/// Returns the command line for the given process.
pub fn get_process_command_line(pid: Pid) -> Result<CommandLine, ProcfsError> {
    let path = format!("/proc/{pid}/cmdline");
    let data = fs::read(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;
    Ok(data
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect())
}

fn process(pid: Pid) -> Result<Process, ProcfsError> {
    Process::new(pid.as_raw()).map_err(|source| ProcfsError::Process {
        pid,
        what: "process",
        source,
    })
}

/// Attach the process and the file being read to a procfs error.
fn reading(pid: Pid, what: &'static str) -> impl FnOnce(ProcError) -> ProcfsError {
    move |source| ProcfsError::Process { pid, what, source }
}

pub fn get_process_stat(pid: Pid) -> Result<ProcessStat, ProcfsError> {
    let stat = process(pid)?.stat().map_err(reading(pid, "stat"))?;
    Ok(ProcessStat {
        comm: stat.comm,
        state: stat.state,
        ppid: Pid::from_raw(stat.ppid),
        tty_nr: stat.tty_nr,
        start_time: stat.starttime,
        vsize: stat.vsize,
    })
}

pub fn get_process_status(pid: Pid) -> Result<ProcessStatus, ProcfsError> {
    let status = process(pid)?.status().map_err(reading(pid, "status"))?;
    Ok(ProcessStatus {
        name: status.name,
        ppid: status.ppid,
        uids: [status.ruid, status.euid, status.suid, status.fuid],
        gids: [status.rgid, status.egid, status.sgid, status.fgid],
        cap_effective: status.capeff,
        cap_permitted: status.capprm,
    })
}

/// Returns at most `max_values` environment variables of the given process
/// as `KEY=VALUE`, sorted by key, and whether some of them were left out.
pub fn get_process_environ(pid: Pid, max_values: usize) -> Result<(Vec<String>, bool), ProcfsError> {
    let environ = process(pid)?.environ().map_err(reading(pid, "environ"))?;
    let mut envs: Vec<String> = environ
        .into_iter()
        .map(|(key, value)| format!("{}={}", key.to_string_lossy(), value.to_string_lossy()))
        .collect();
    envs.sort();
    let truncated = envs.len() > max_values;
    envs.truncate(max_values);
    Ok((envs, truncated))
}

/// Returns the audit login uid of the given process.
pub fn get_process_login_uid(pid: Pid) -> Result<u32, ProcfsError> {
    process(pid)?.loginuid().map_err(reading(pid, "loginuid"))
}

/// Returns the name of the terminal attached to stdin, like `pts/3`.
pub fn get_process_tty(pid: Pid) -> Option<String> {
    let target = fs::read_link(format!("/proc/{pid}/fd/0")).ok()?;
    let target = target.to_str()?;
    let name = target.strip_prefix("/dev/")?;
    (name.starts_with("pts") || name.starts_with("tty")).then(|| name.to_owned())
}

/// Returns the cgroup path of the given process, preferring the unified hierarchy.
pub fn get_process_cgroup(pid: Pid) -> Result<Option<String>, ProcfsError> {
    let cgroups = process(pid)?.cgroups().map_err(reading(pid, "cgroup"))?;
    Ok(preferred_cgroup(
        cgroups
            .into_iter()
            .map(|cgroup| (cgroup.hierarchy, cgroup.pathname)),
    ))
}

fn preferred_cgroup(cgroups: impl IntoIterator<Item = (u32, String)>) -> Option<String> {
    let mut first = None;
    for (hierarchy, path) in cgroups {
        if hierarchy == 0 {
            return Some(path);
        }
        first.get_or_insert(path);
    }
    first
}

pub fn get_running_processes() -> Result<Vec<Pid>, ProcfsError> {
    glob("/proc/[0-9]*")?
        .map(|entry| {
            let entry: String = entry?.to_string_lossy().into();
            let pid = entry.replace("/proc/", "").parse()?;
            Ok(Pid::from_raw(pid))
        })
        .collect()
}

/// Returns the boot time in seconds since the unix epoch.
pub fn get_boot_time() -> Result<u64, ProcfsError> {
    procfs::boot_time_secs().map_err(ProcfsError::BootTime)
}

/// Converts a process start time in clock ticks since boot to nanoseconds.
pub fn ticks_to_nanos(ticks: u64) -> u64 {
    let ticks_per_second = procfs::ticks_per_second().max(1);
    ticks.saturating_mul(1_000_000_000 / ticks_per_second)
}

/// Kernel threads are `kthreadd` itself and its children.
pub fn is_kernel_thread(pid: Pid, ppid: Pid) -> bool {
    pid.as_raw() == KTHREADD_PID || ppid.as_raw() == KTHREADD_PID
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cgroup_prefers_unified() {
        let cgroups = [
            (12, "/docker/abc".to_owned()),
            (0, "/system.slice/sshd.service".to_owned()),
        ];
        assert_eq!(
            preferred_cgroup(cgroups).as_deref(),
            Some("/system.slice/sshd.service")
        );
        assert_eq!(
            preferred_cgroup([(4, "/user.slice".to_owned())]).as_deref(),
            Some("/user.slice")
        );
        assert_eq!(preferred_cgroup(Vec::<(u32, String)>::new()), None);
    }

    #[test]
    fn kernel_threads() {
        assert!(is_kernel_thread(Pid::from_raw(2), Pid::from_raw(0)));
        assert!(is_kernel_thread(Pid::from_raw(57), Pid::from_raw(2)));
        assert!(!is_kernel_thread(Pid::from_raw(57), Pid::from_raw(1)));
    }

    #[test]
    fn ticks_scale_to_nanos() {
        let ticks_per_second = procfs::ticks_per_second();
        assert_eq!(ticks_to_nanos(ticks_per_second), 1_000_000_000);
        assert_eq!(ticks_to_nanos(0), 0);
    }

    #[test]
    fn own_process() {
        let pid = Pid::this();
        let stat = get_process_stat(pid).unwrap();
        assert_eq!(stat.ppid, Pid::parent());
        assert!(stat.vsize > 0);
        assert!(stat.start_time > 0);

        let status = get_process_status(pid).unwrap();
        assert_eq!(status.ppid, Pid::parent().as_raw());
        assert_eq!(status.uids[0], nix::unistd::getuid().as_raw());
        assert_eq!(status.gids[0], nix::unistd::getgid().as_raw());

        assert_eq!(get_process_image(pid).unwrap(), std::env::current_exe().unwrap());
        assert!(!get_process_command_line(pid).unwrap().is_empty());
        assert!(get_running_processes().unwrap().contains(&pid));
        assert!(get_boot_time().unwrap() > 0);
    }

    #[test]
    fn environ_is_bounded() {
        let pid = Pid::this();
        let (all, truncated) = get_process_environ(pid, usize::MAX).unwrap();
        assert!(!truncated);
        assert!(all.iter().all(|env| env.contains('=')));
        assert!(all.windows(2).all(|pair| pair[0] <= pair[1]));

        if !all.is_empty() {
            let (envs, truncated) = get_process_environ(pid, all.len() - 1).unwrap();
            assert!(truncated);
            assert_eq!(envs.len(), all.len() - 1);
        }
    }

    #[test]
    fn gone_process() {
        let pid = Pid::from_raw(i32::MAX);
        assert!(matches!(
            get_process_stat(pid),
            Err(ProcfsError::Process { .. })
        ));
    }
}
