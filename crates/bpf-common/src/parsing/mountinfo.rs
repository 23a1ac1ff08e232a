use nix::unistd::Pid;
use procfs::{
    ProcError,
    process::{MountInfo, Process},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MountinfoError {
    #[error("reading mountinfo of process {pid} failed")]
    Process {
        pid: Pid,
        #[source]
        source: ProcError,
    },
    #[error("could not find cgroup2 filesystem mount")]
    Cgroup2NotFound,
    #[error("mount {mount_id} not found")]
    MountNotFound { mount_id: u32 },
}

/// Returns the mounts visible from the mount namespace of the given process.
pub fn get_process_mounts(pid: Pid) -> Result<Vec<MountInfo>, MountinfoError> {
    let error = |source| MountinfoError::Process { pid, source };
    let mounts = Process::new(pid.as_raw())
        .map_err(error)?
        .mountinfo()
        .map_err(error)?;
    Ok(mounts.into_iter().collect())
}

/// Returns a single mount of the given process.
pub fn get_process_mount(pid: Pid, mount_id: u32) -> Result<MountInfo, MountinfoError> {
    get_process_mounts(pid)?
        .into_iter()
        .find(|mount| u32::try_from(mount.mnt_id).ok() == Some(mount_id))
        .ok_or(MountinfoError::MountNotFound { mount_id })
}

fn cgroup2_mountpoint(mounts: Vec<MountInfo>) -> Result<String, MountinfoError> {
    mounts
        .into_iter()
        .find(|mount| mount.fs_type == "cgroup2")
        .map(|mount| mount.mount_point.to_string_lossy().into_owned())
        .ok_or(MountinfoError::Cgroup2NotFound)
}

/// Returns the mount point of the cgroup v2 hierarchy filesystem.
///
/// On the most of Linux distributions, it returns either `/sys/fs/cgroup` or
/// `/sys/fs/cgroup/unified`.
pub fn get_cgroup2_mountpoint() -> Result<String, MountinfoError> {
    cgroup2_mountpoint(get_process_mounts(Pid::this())?)
}
