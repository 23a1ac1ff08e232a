use std::{
    collections::{HashMap, VecDeque, hash_map::Values},
    sync::Arc,
    time::Duration,
};

use bpf_common::{Pid, time::Timestamp};

use crate::{pool::ProcessRef, stats::Stats};

/// Why a pid waits in the cleanup queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueReason {
    /// An exit was observed, the entry stays until its retention window elapses.
    Exited,
    /// The pid is gone from procfs, the entry can go right away.
    Absent,
}

/// Map from pid to the current image of the process, plus the cleanup queue.
pub struct ProcessTable {
    entries: HashMap<Pid, ProcessRef>,
    queue: VecDeque<(Pid, QueueReason)>,
    stats: Arc<Stats>,
}

impl ProcessTable {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            entries: HashMap::new(),
            queue: VecDeque::new(),
            stats,
        }
    }

    pub fn get(&self, pid: Pid) -> Option<&ProcessRef> {
        self.entries.get(&pid)
    }

    /// Insert the current image of a pid, returning the one it replaces.
    pub fn insert(&mut self, process: ProcessRef) -> Option<ProcessRef> {
        if process.mark_counted() {
            self.stats.entry_retained();
        }
        let pid = process.pid();
        self.entries.insert(pid, process)
    }

    pub fn remove(&mut self, pid: Pid) -> Option<ProcessRef> {
        self.entries.remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> Values<'_, Pid, ProcessRef> {
        self.entries.values()
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.entries.keys().copied()
    }

    pub fn enqueue(&mut self, pid: Pid, reason: QueueReason) {
        self.queue.push_back((pid, reason));
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Delete queued entries that are due. Exited entries are due once their
    /// exec time (fork time without an exec) is older than `retention`, or
    /// right away when neither is known. Entries not yet due stay queued.
    /// Returns the number of deleted entries.
    pub fn dequeue_exited(&mut self, now: Timestamp, retention: Duration) -> usize {
        let mut deleted = 0;
        let mut pending = VecDeque::with_capacity(self.queue.len());
        while let Some((pid, reason)) = self.queue.pop_front() {
            let Some(process) = self.entries.get(&pid) else {
                continue;
            };
            let due = match reason {
                QueueReason::Absent => true,
                QueueReason::Exited => {
                    let entry = process.read();
                    if !entry.has_exited() {
                        // the pid was reused by a live process
                        continue;
                    }
                    let reference = if entry.exec_time.is_zero() {
                        entry.fork_time
                    } else {
                        entry.exec_time
                    };
                    reference.is_zero() || reference.elapsed_until(now) > retention
                }
            };
            if due {
                self.entries.remove(&pid);
                self.stats.flushed();
                deleted += 1;
            } else {
                pending.push_back((pid, reason));
            }
        }
        self.queue = pending;
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::EntryPool;

    const RETENTION: Duration = Duration::from_secs(60);
    const MINUTE_NS: u64 = 60_000_000_000;

    fn setup() -> (ProcessTable, EntryPool, Arc<Stats>) {
        let stats = Arc::new(Stats::default());
        (
            ProcessTable::new(stats.clone()),
            EntryPool::new(8, stats.clone()),
            stats,
        )
    }

    fn insert(table: &mut ProcessTable, pool: &EntryPool, pid: i32, fork_ns: u64, exit_ns: u64) {
        let mut entry = pool.get();
        entry.pid = Pid::from_raw(pid);
        entry.tid = entry.pid;
        entry.fork_time = Timestamp::from(fork_ns);
        entry.exit_time = Timestamp::from(exit_ns);
        table.insert(pool.seal(entry));
    }

    #[test]
    fn gauge_follows_insert_and_release() {
        let (mut table, pool, stats) = setup();
        insert(&mut table, &pool, 10, 1, 0);
        insert(&mut table, &pool, 11, 1, 0);
        assert_eq!(stats.live_entries(), 2);

        // replacing the image releases the previous one
        insert(&mut table, &pool, 10, 2, 0);
        assert_eq!(table.len(), 2);
        assert_eq!(stats.live_entries(), 2);

        table.remove(Pid::from_raw(11));
        assert_eq!(stats.live_entries(), 1);
    }

    #[test]
    fn exited_entries_wait_for_retention() {
        let (mut table, pool, _) = setup();
        let now = 10 * MINUTE_NS;
        insert(&mut table, &pool, 20, now - 2 * MINUTE_NS, now);
        insert(&mut table, &pool, 21, now - MINUTE_NS / 2, now);
        table.enqueue(Pid::from_raw(20), QueueReason::Exited);
        table.enqueue(Pid::from_raw(21), QueueReason::Exited);

        assert_eq!(table.dequeue_exited(Timestamp::from(now), RETENTION), 1);
        assert!(table.get(Pid::from_raw(20)).is_none());
        assert!(table.get(Pid::from_raw(21)).is_some());
        assert_eq!(table.queued(), 1);

        let later = Timestamp::from(now + MINUTE_NS);
        assert_eq!(table.dequeue_exited(later, RETENTION), 1);
        assert!(table.is_empty());
        assert_eq!(table.queued(), 0);
    }

    #[test]
    fn reused_pid_is_skipped() {
        let (mut table, pool, _) = setup();
        insert(&mut table, &pool, 30, 0, 5);
        table.enqueue(Pid::from_raw(30), QueueReason::Exited);
        insert(&mut table, &pool, 30, 7, 0);

        assert_eq!(table.dequeue_exited(Timestamp::from(MINUTE_NS * 5), RETENTION), 0);
        assert!(table.get(Pid::from_raw(30)).is_some());
        assert_eq!(table.queued(), 0);
    }

    #[test]
    fn absent_and_unknown_times_are_deleted() {
        let (mut table, pool, stats) = setup();
        insert(&mut table, &pool, 40, 0, 1);
        insert(&mut table, &pool, 41, 9, 0);
        table.enqueue(Pid::from_raw(40), QueueReason::Exited);
        table.enqueue(Pid::from_raw(41), QueueReason::Absent);
        table.enqueue(Pid::from_raw(42), QueueReason::Absent);

        assert_eq!(table.dequeue_exited(Timestamp::from(10), RETENTION), 2);
        assert!(table.is_empty());
        assert_eq!(stats.live_entries(), 0);
        assert_eq!(stats.drain(0).flushed, 2);
    }
}
