//! Container identification from cgroup paths.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Pattern for matching cgroups created by Docker.
    static ref RE_CGROUP_DOCKER: Regex = Regex::new(r"docker.(?P<id>[0-9a-f]{12,64})(?:[^0-9a-f]|$)").unwrap();
    /// Pattern for matching cgroups created by libpod/podman.
    static ref RE_CGROUP_LIBPOD: Regex = Regex::new(r"libpod(?:-conmon)?-(?P<id>[0-9a-f]{12,64})(?:[^0-9a-f]|$)").unwrap();
    /// Pattern for matching cgroups created by containerd and cri-o, including kubepods slices.
    static ref RE_CGROUP_CRI: Regex = Regex::new(r"(?:cri-containerd|crio)[-:](?P<id>[0-9a-f]{64})(?:[^0-9a-f]|$)").unwrap();
    /// Bare 64 characters ids as found under cgroupfs kubepods hierarchies.
    static ref RE_CGROUP_KUBEPODS: Regex = Regex::new(r"kubepods.*/(?P<id>[0-9a-f]{64})(?:[^0-9a-f]|$)").unwrap();
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerId {
    Docker(String),
    Libpod(String),
    Cri(String),
}

impl ContainerId {
    pub fn as_str(&self) -> &str {
        match self {
            ContainerId::Docker(id) | ContainerId::Libpod(id) | ContainerId::Cri(id) => id,
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Extract a container id from a cgroup path or a `/proc/<pid>/cgroup` line.
pub fn container_id_from_cgroup(cgroup_info: &str) -> Option<ContainerId> {
    if let Some(id) = capture_id(&RE_CGROUP_DOCKER, cgroup_info) {
        return Some(ContainerId::Docker(id));
    }
    if let Some(id) = capture_id(&RE_CGROUP_LIBPOD, cgroup_info) {
        return Some(ContainerId::Libpod(id));
    }
    capture_id(&RE_CGROUP_CRI, cgroup_info)
        .or_else(|| capture_id(&RE_CGROUP_KUBEPODS, cgroup_info))
        .map(ContainerId::Cri)
}

fn capture_id(re: &Regex, cgroup_info: &str) -> Option<String> {
    re.captures(cgroup_info)
        .and_then(|caps| caps.name("id"))
        .map(|id| id.as_str().to_owned())
}
