use std::{sync::Arc, thread, time::Duration};

use bpf_common::{Pid, parsing::encode_string_list, time::Timestamp};
use process_resolver::{
    CredentialsChange, HitSource, ProcessRef, ProcessResolver, ResolverConfig, ResolverError,
    SnapshotState, Source,
    entry::{CgroupContext, Credentials, FileFields, SecurityCredential},
    kernel_maps::KernelMaps,
    record::{PidRecord, ProcRecord},
    test_utils::{BOOT_TIME_NS, MOUNT_ID, Mocks, exec_event, fork_event, resolver, resolver_with},
};

const BASH: u64 = 55;
const LS: u64 = 77;

fn pid(raw: i32) -> Pid {
    Pid::from_raw(raw)
}

/// Pid 100 forked from an unknown init, then running bash.
fn seed_bash(resolver: &ProcessResolver, mocks: &Mocks) -> ProcessRef {
    mocks.path.insert(BASH, "/bin/bash");
    let mut fork = fork_event(resolver, 100, 1, 0);
    fork.cookie = 42;
    fork.fork_time = Timestamp::from(1_000);
    resolver.on_fork(fork).unwrap();
    let mut exec = exec_event(resolver, 100, BASH, 0);
    exec.comm = "bash".to_owned();
    exec.exec_time = Timestamp::from(2_000);
    resolver.on_exec(exec).unwrap()
}

#[test]
fn fork_then_exec() {
    let (resolver, mocks) = resolver();
    mocks.path.insert(LS, "/usr/bin/ls");
    let bash = seed_bash(&resolver, &mocks);

    let mut fork = fork_event(&resolver, 200, 100, BASH);
    fork.fork_time = Timestamp::from(3_000);
    let forked = resolver.on_fork(fork).unwrap();
    assert_eq!(forked.created.len(), 1);
    let child = forked.process.unwrap();
    {
        let entry = child.read();
        assert_eq!(entry.cookie, 42);
        assert_eq!(entry.file.path, "/bin/bash");
        assert!(!entry.is_exec);
        assert!(!entry.is_parent_missing);
        assert!(Arc::ptr_eq(entry.ancestor.as_ref().unwrap(), &bash));
    }

    let mut exec = exec_event(&resolver, 200, LS, BASH);
    exec.comm = "ls".to_owned();
    exec.exec_time = Timestamp::from(4_000);
    let ls = resolver.on_exec(exec).unwrap();
    let entry = ls.read();
    assert_eq!(entry.pid, pid(200));
    assert_eq!(entry.ppid, pid(100));
    assert_eq!(entry.cookie, 42);
    assert_eq!(entry.file.path, "/usr/bin/ls");
    assert_eq!(entry.file.basename, "ls");
    assert_eq!(entry.file.filesystem, "ext4");
    assert_eq!(entry.file.fields.mount_id, MOUNT_ID);
    assert_eq!(entry.exec_inode, LS);
    assert_eq!(entry.credentials.user, "root");
    assert_eq!(entry.fork_time, Timestamp::from(3_000));
    assert!(entry.exec_time > entry.fork_time);
    assert!(entry.is_exec);
    assert!(!entry.is_parent_missing);
    assert!(Arc::ptr_eq(entry.ancestor.as_ref().unwrap(), &child));
    assert_eq!(child.read().exit_time, Timestamp::from(4_000));
    drop(entry);

    assert!(Arc::ptr_eq(&resolver.get(pid(200)).unwrap(), &ls));
    assert_eq!(resolver.len(), 2);
    let report = resolver.report();
    assert_eq!(report.added(Source::Event), 4);
    // only the first fork had no parent
    assert_eq!(report.broken_lineage, 1);
}

#[test]
fn exit_then_retention() {
    let (resolver, mocks) = resolver();
    seed_bash(&resolver, &mocks);
    let mut fork = fork_event(&resolver, 200, 100, BASH);
    fork.fork_time = Timestamp::now();
    resolver.on_fork(fork).unwrap();
    // fork 100, exec 100, fork 200
    assert_eq!(resolver.stats().live_entries(), 3);

    let exited = resolver.on_exit(pid(200), pid(200), 0, Timestamp::ZERO);
    assert_eq!(exited.source, Some(HitSource::Cache));
    assert!(exited.process.unwrap().read().has_exited());

    let now = Timestamp::now();
    // bash exec time is ancient
    assert_eq!(resolver.dequeue_exited_at(now), 1);
    assert!(resolver.get(pid(200)).is_none());
    assert_eq!(resolver.stats().live_entries(), 2);

    assert!(resolver.on_exit(pid(200), pid(200), 0, now).process.is_none());
}

#[test]
fn exited_entries_wait_for_retention() {
    let (resolver, mocks) = resolver();
    mocks.path.insert(LS, "/usr/bin/ls");
    seed_bash(&resolver, &mocks);
    resolver.on_fork(fork_event(&resolver, 200, 100, BASH)).unwrap();
    resolver.on_exec(exec_event(&resolver, 200, LS, BASH)).unwrap();
    resolver.on_exit(pid(200), pid(200), LS, Timestamp::now());

    let now = Timestamp::now();
    assert_eq!(resolver.dequeue_exited_at(now), 0);
    assert!(resolver.get(pid(200)).is_some());
    assert_eq!(resolver.dequeue_exited_at(now + Duration::from_secs(61)), 1);
    assert!(resolver.get(pid(200)).is_none());
}

#[test]
fn sweep_releases_lineage() {
    let (resolver, mocks) = resolver();
    seed_bash(&resolver, &mocks);
    resolver.on_fork(fork_event(&resolver, 200, 100, BASH)).unwrap();

    let live = [pid(100)].into_iter().collect();
    assert_eq!(resolver.gc_sweep(&live), 1);
    assert_eq!(resolver.stats().live_entries(), 2);

    assert_eq!(resolver.gc_sweep(&Default::default()), 1);
    assert!(resolver.is_empty());
    assert_eq!(resolver.stats().live_entries(), 0);
    assert_eq!(resolver.report().flushed, 2);
}

#[test]
fn delete_entry_now() {
    let (resolver, mocks) = resolver();
    seed_bash(&resolver, &mocks);
    let bash = resolver.get(pid(100)).unwrap();
    resolver.delete_entry(pid(100), Timestamp::from(9));
    assert!(resolver.get(pid(100)).is_none());
    assert_eq!(bash.read().exit_time, Timestamp::from(9));
}

#[test]
fn repeated_exec_reuses_entry() {
    let (resolver, mocks) = resolver();
    let args = encode_string_list(&["bash", "-c", "true"]);
    let bash = seed_bash(&resolver, &mocks);
    assert!(bash.read().args.is_none());

    let exec = |time: u64| {
        resolver.update_args_envs(9, &args);
        let mut exec = exec_event(&resolver, 100, BASH, BASH);
        exec.comm = "bash".to_owned();
        exec.args_id = 9;
        exec.exec_time = Timestamp::from(time);
        resolver.on_exec(exec).unwrap()
    };
    let first = exec(5_000);
    assert!(!Arc::ptr_eq(&first, &bash));
    let second = exec(6_000);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.read().exec_time, Timestamp::from(6_000));
    assert!(!second.read().is_parent_missing);
    assert_eq!(resolver.len(), 1);
    assert_eq!(resolver.report().added(Source::Event), 3);
}

#[test]
fn long_exec_chain_is_deleted() {
    let (resolver, mocks) = resolver();
    mocks.path.insert(LS, "/usr/bin/ls");
    seed_bash(&resolver, &mocks);

    let mut prev = BASH;
    for _ in 0..100_000 {
        let next = if prev == BASH { LS } else { BASH };
        resolver.on_exec(exec_event(&resolver, 100, next, prev)).unwrap();
        prev = next;
    }
    assert_eq!(resolver.len(), 1);
    assert!(resolver.stats().live_entries() > 100_000);

    resolver.delete_entry(pid(100), Timestamp::now());
    assert!(resolver.is_empty());
    assert_eq!(resolver.stats().live_entries(), 0);
}

#[test]
fn failed_exec_is_not_cached() {
    let (resolver, mocks) = resolver();
    let bash = seed_bash(&resolver, &mocks);
    let err = resolver
        .on_exec(exec_event(&resolver, 100, 999, BASH))
        .unwrap_err();
    assert!(matches!(err.source, ResolverError::PathResolution { .. }));
    let entry = err.entry.unwrap();
    assert_eq!(entry.read().file.fields.inode, 999);
    assert!(entry.read().file.path.is_empty());
    assert!(Arc::ptr_eq(&resolver.get(pid(100)).unwrap(), &bash));
    assert_eq!(resolver.report().path_errors, 1);
}

#[test]
fn failed_filesystem_lookup() {
    let (resolver, mocks) = resolver();
    mocks.path.insert(BASH, "/bin/bash");
    mocks.mount.fail(MOUNT_ID);
    let err = resolver
        .on_exec(exec_event(&resolver, 100, BASH, 0))
        .unwrap_err();
    assert!(matches!(
        err.source,
        ResolverError::Filesystem {
            mount_id: MOUNT_ID,
            ..
        }
    ));
    assert!(resolver.is_empty());
}

#[test]
fn invalid_forks() {
    let (resolver, _) = resolver();
    assert!(matches!(
        resolver.on_fork(fork_event(&resolver, 0, 1, 0)),
        Err(ResolverError::NoPid(_))
    ));
    assert!(matches!(
        resolver.on_fork(fork_event(&resolver, 57, 2, 0)),
        Err(ResolverError::KernelThread(_))
    ));
    assert!(resolver.is_empty());
}

#[test]
fn inode_mismatch_is_a_miss() {
    let (resolver, mocks) = resolver();
    let bash = seed_bash(&resolver, &mocks);
    // the unknown parent of the seed is a miss too
    resolver.report();

    let stale = resolver.resolve(pid(100), pid(101), LS, true);
    assert!(stale.process.is_none());
    assert!(stale.created.is_empty());

    let hit = resolver.resolve(pid(100), pid(101), BASH, true);
    assert_eq!(hit.source, Some(HitSource::Cache));
    assert!(Arc::ptr_eq(&hit.process.unwrap(), &bash));
    assert_eq!(bash.read().tid, pid(101));

    let report = resolver.report();
    assert_eq!(report.misses, 1);
    assert_eq!(report.hits(HitSource::Cache), 1);
}

#[test]
fn procfs_fallback_is_rate_limited() {
    let (resolver, _) = resolver();
    resolver.set_state(SnapshotState::Snapshotted);
    // above the kernel pid limit, never in procfs
    let missing = pid(4_000_000);
    for _ in 0..5 {
        assert!(resolver.resolve(missing, missing, 0, true).process.is_none());
    }
    let report = resolver.report();
    assert_eq!(report.fallback_attempts, 1);
    assert_eq!(report.fallback_throttled, 4);
    assert_eq!(report.misses, 5);
}

#[test]
fn no_fallback_before_snapshot() {
    let (resolver, mocks) = resolver();
    mocks
        .maps
        .put_pid(pid(300), PidRecord::default().encode())
        .unwrap();
    assert!(resolver.resolve(pid(300), pid(300), 0, true).process.is_none());
    let report = resolver.report();
    assert_eq!(report.fallback_attempts, 0);
    assert_eq!(report.misses, 1);
}

fn put_records(mocks: &Mocks, raw_pid: i32, ppid: u32, inode: u64, exec_ns: u64) {
    let cookie = 7_000 + raw_pid as u64;
    let pid_record = PidRecord {
        cookie,
        ppid,
        fork_ns: 10,
        credentials: Credentials {
            uid: 1000,
            euid: 1000,
            gid: 100,
            ..Default::default()
        },
        ..Default::default()
    };
    let proc_record = ProcRecord {
        container_id: "abc".to_owned(),
        cgroup_inode: 5,
        file: FileFields {
            inode,
            mount_id: MOUNT_ID,
            ..Default::default()
        },
        exec_ns,
        comm: "nginx".to_owned(),
        ..Default::default()
    };
    mocks.maps.put_pid(pid(raw_pid), pid_record.encode()).unwrap();
    mocks.maps.put_proc(cookie, proc_record.encode()).unwrap();
}

#[test]
fn kernel_map_exec_entry() {
    let (resolver, mocks) = resolver();
    mocks.path.insert(88, "/usr/sbin/nginx");
    put_records(&mocks, 300, 1, 88, 20);
    resolver.set_state(SnapshotState::Snapshotted);

    let resolution = resolver.resolve(pid(300), pid(300), 88, false);
    assert_eq!(resolution.source, Some(HitSource::KernelMaps));
    assert_eq!(resolution.created.len(), 1);
    assert!(resolution.created[0].error.is_none());
    let process = resolution.process.unwrap();
    {
        let entry = process.read();
        assert_eq!(entry.source, Source::KernelMap);
        assert_eq!(entry.cookie, 7_300);
        assert_eq!(entry.fork_time, Timestamp::from(BOOT_TIME_NS + 10));
        assert_eq!(entry.exec_time, Timestamp::from(BOOT_TIME_NS + 20));
        assert_eq!(entry.file.path, "/usr/sbin/nginx");
        assert_eq!(entry.comm, "nginx");
        assert_eq!(entry.container_id, "abc");
        assert_eq!(entry.credentials.user, "user1000");
        assert_eq!(entry.credentials.group, "group100");
        assert!(entry.is_exec);
        assert!(entry.is_parent_missing);
    }

    let again = resolver.resolve(pid(300), pid(300), 88, false);
    assert_eq!(again.source, Some(HitSource::Cache));
    assert!(again.created.is_empty());
    let report = resolver.report();
    assert_eq!(report.hits(HitSource::KernelMaps), 1);
    assert_eq!(report.added(Source::KernelMap), 1);
}

#[test]
fn kernel_map_fork_links_cached_parent() {
    let (resolver, mocks) = resolver();
    let bash = seed_bash(&resolver, &mocks);
    put_records(&mocks, 400, 100, BASH, 0);
    resolver.set_state(SnapshotState::Snapshotted);

    let process = resolver.resolve(pid(400), pid(400), 0, false).process.unwrap();
    let entry = process.read();
    assert_eq!(entry.ppid, pid(100));
    assert_eq!(entry.cookie, 7_400);
    assert!(!entry.is_exec);
    assert!(!entry.is_parent_missing);
    assert!(Arc::ptr_eq(entry.ancestor.as_ref().unwrap(), &bash));
}

#[test]
fn kernel_map_inode_mismatch() {
    let (resolver, mocks) = resolver();
    mocks.path.insert(88, "/usr/sbin/nginx");
    put_records(&mocks, 301, 1, 88, 20);
    resolver.set_state(SnapshotState::Snapshotted);

    let resolution = resolver.resolve(pid(301), pid(301), 12345, false);
    assert!(resolution.process.is_none());
    assert!(resolver.is_empty());
    assert_eq!(resolver.report().inode_errors, 1);
}

#[test]
fn args_chunks_are_joined() {
    let (resolver, mocks) = resolver();
    seed_bash(&resolver, &mocks);
    let first = encode_string_list(&["python3", "-c"]);
    let second = encode_string_list(&["print(1)"]);
    resolver.update_args_envs(11, &first);
    resolver.update_args_envs(11, &second);
    resolver.update_args_envs(12, &encode_string_list(&["HOME=/root"]));

    mocks.path.insert(LS, "/usr/bin/python3");
    let mut exec = exec_event(&resolver, 100, LS, BASH);
    exec.args_id = 11;
    exec.envs_id = 12;
    let process = resolver.on_exec(exec).unwrap();
    let entry = process.read();
    let args: Vec<&str> = entry.args_values().iter().map(|a| a.as_ref()).collect();
    assert_eq!(args, vec!["python3", "-c", "print(1)"]);
    assert!(!entry.args.as_ref().unwrap().truncated);
    assert_eq!(entry.envs.as_ref().unwrap().values[0].as_ref(), "HOME=/root");

    let report = resolver.report();
    assert_eq!(report.args_size, (first.len() + second.len()) as i64);
    assert_eq!(report.args_truncated, 0);
}

#[test]
fn envs_resolution_can_be_disabled() {
    let (resolver, mocks) = resolver_with(ResolverConfig {
        envs_resolution: false,
        tty_fallback: false,
        ..Default::default()
    });
    mocks.path.insert(BASH, "/bin/bash");
    resolver.update_args_envs(12, &encode_string_list(&["HOME=/root"]));
    let mut exec = exec_event(&resolver, 100, BASH, 0);
    exec.envs_id = 12;
    let process = resolver.on_exec(exec).unwrap();
    assert!(process.read().envs.is_none());
}

#[test]
fn busybox_applets() {
    let (resolver, mocks) = resolver();
    mocks.path.insert(66, "/bin/busybox");
    resolver.update_args_envs(1, &encode_string_list(&["/bin/ls", "-l"]));
    let mut exec = exec_event(&resolver, 100, 66, 0);
    exec.args_id = 1;
    let process = resolver.on_exec(exec).unwrap();
    let entry = process.read();
    let symlink = entry.symlink.as_ref().unwrap();
    assert_eq!(symlink.basename, "ls");
    assert_eq!(symlink.paths, ["/bin/ls".to_owned(), "/usr/bin/ls".to_owned()]);
}

#[test]
fn credential_changes() {
    let (resolver, mocks) = resolver();
    let bash = seed_bash(&resolver, &mocks);

    let setuid = CredentialsChange::SetUid {
        uid: 1000,
        euid: 0,
        fsuid: 1000,
    };
    assert!(!resolver.update_credentials(pid(100), pid(101), setuid));
    assert_eq!(bash.read().credentials.uid, 0);
    assert!(resolver.update_credentials(pid(100), pid(100), setuid));
    assert!(resolver.update_credentials(
        pid(100),
        pid(100),
        CredentialsChange::SetGid {
            gid: 5,
            egid: 5,
            fsgid: 5
        }
    ));
    assert!(resolver.update_credentials(pid(100), pid(100), CredentialsChange::LoginUid(1000)));
    assert!(!resolver.update_credentials(pid(999), pid(999), setuid));

    let credentials = bash.read().credentials.clone();
    assert_eq!(credentials.user, "user1000");
    assert_eq!(credentials.euser, "root");
    assert_eq!(credentials.fsuser, "user1000");
    assert_eq!(credentials.egroup, "group5");
    assert_eq!(credentials.auid, 1000);
}

#[test]
fn security_credentials() {
    let (resolver, mocks) = resolver();
    seed_bash(&resolver, &mocks);
    let credential = |key: &str, expiration: u64| SecurityCredential {
        access_key_id: key.to_owned(),
        kind: "aws".to_owned(),
        expiration: Timestamp::from(expiration),
    };
    assert!(resolver.add_security_credentials(pid(100), credential("AKIA1", 100)));
    assert!(resolver.add_security_credentials(pid(100), credential("AKIA1", 500)));
    assert!(resolver.add_security_credentials(pid(100), credential("AKIA2", 300)));
    assert!(!resolver.add_security_credentials(pid(100), credential("", 300)));
    assert!(!resolver.add_security_credentials(pid(999), credential("AKIA3", 300)));

    let valid = resolver.fetch_security_credentials(pid(100), Timestamp::from(50));
    assert_eq!(valid.len(), 2);
    let valid = resolver.fetch_security_credentials(pid(100), Timestamp::from(200));
    assert_eq!(valid, vec![credential("AKIA2", 300)]);
    assert!(resolver
        .fetch_security_credentials(pid(100), Timestamp::from(400))
        .is_empty());
}

#[test]
fn cgroup_updates() {
    let (resolver, mocks) = resolver();
    let bash = seed_bash(&resolver, &mocks);
    let id = "0123456789abcdef".repeat(4);

    assert!(resolver.update_cgroup_context(
        pid(100),
        CgroupContext {
            id: format!("/system.slice/docker-{id}.scope"),
            ..Default::default()
        }
    ));
    assert_eq!(bash.read().container_id, id);

    assert!(resolver.update_cgroup_context(
        pid(100),
        CgroupContext {
            id: "/system.slice/cron.service".to_owned(),
            file_inode: 12,
            ..Default::default()
        }
    ));
    let entry = bash.read();
    assert_eq!(entry.container_id, id);
    assert_eq!(entry.cgroup.file_inode, 12);
    drop(entry);

    assert!(!resolver.update_cgroup_context(pid(999), CgroupContext::default()));
}

#[test]
fn concurrent_lifecycles() {
    let (resolver, mocks) = resolver();
    mocks.path.insert(LS, "/usr/bin/ls");
    seed_bash(&resolver, &mocks);
    let resolver = Arc::new(resolver);

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let resolver = resolver.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let child = 1_000 + worker * 100 + i;
                    resolver
                        .on_fork(fork_event(&resolver, child, 100, BASH))
                        .unwrap();
                    resolver
                        .on_exec(exec_event(&resolver, child, LS, BASH))
                        .unwrap();
                    let found = resolver.resolve(pid(child), pid(child), LS, false);
                    assert_eq!(found.source, Some(HitSource::Cache));
                    resolver.on_exit(pid(child), pid(child), LS, Timestamp::now());
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(resolver.len(), 401);
    assert_eq!(resolver.gc_sweep(&[pid(100)].into_iter().collect()), 400);
    assert_eq!(resolver.len(), 1);
    // fork and exec of 100
    assert_eq!(resolver.stats().live_entries(), 2);
}

#[test]
fn sync_own_process() {
    let (resolver, mocks) = resolver();
    let me = Pid::this();
    let process = resolver.sync_cache(me).unwrap();
    let entry = process.read();
    assert_eq!(entry.source, Source::Snapshot);
    assert_eq!(entry.ppid, Pid::parent());
    assert_eq!(
        std::path::Path::new(&entry.file.path),
        std::env::current_exe().unwrap()
    );
    assert_eq!(entry.exec_inode, entry.file.fields.inode);
    assert_ne!(entry.file.fields.inode, 0);
    assert!(!entry.args_values().is_empty());

    let record = mocks.maps.lookup_pid(me).unwrap().unwrap();
    let record = PidRecord::decode(&record).unwrap();
    assert_eq!(record.cookie, entry.cookie);
    assert_eq!(record.ppid, Pid::parent().as_raw() as u32);
    assert_eq!(
        Timestamp::from(BOOT_TIME_NS + record.fork_ns),
        entry.fork_time
    );
    assert_eq!(mocks.maps.proc_count(), 1);
}

#[test]
fn procfs_fallback_for_live_process() {
    let (resolver, _) = resolver();
    resolver.set_state(SnapshotState::Snapshotted);
    let me = Pid::this();
    let resolution = resolver.resolve(me, me, 0, true);
    assert_eq!(resolution.source, Some(HitSource::Procfs));
    let process = resolution.process.unwrap();
    assert_eq!(process.read().source, Source::Procfs);
    // ancestors come first
    let last = resolution.created.last().unwrap();
    assert!(Arc::ptr_eq(&last.process, &process));
    // uncached parents are read in the same attempt
    assert_eq!(resolver.report().fallback_attempts, 1);
}
