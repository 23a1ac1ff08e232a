//! Resolver counters. Counters are drained on report, the live entry gauge is not.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

use crate::entry::Source;

/// Where a resolution was satisfied from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HitSource {
    Cache,
    KernelMaps,
    Procfs,
}

impl HitSource {
    const ALL: [HitSource; 3] = [HitSource::Cache, HitSource::KernelMaps, HitSource::Procfs];

    pub fn as_str(&self) -> &'static str {
        match self {
            HitSource::Cache => "cache",
            HitSource::KernelMaps => "kernel_maps",
            HitSource::Procfs => "procfs",
        }
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    live_entries: AtomicI64,
    hits: [AtomicI64; 3],
    added: [AtomicI64; 4],
    misses: AtomicI64,
    flushed: AtomicI64,
    path_errors: AtomicI64,
    inode_errors: AtomicI64,
    broken_lineage: AtomicI64,
    fallback_attempts: AtomicI64,
    fallback_throttled: AtomicI64,
    args_truncated: AtomicI64,
    args_size: AtomicI64,
    envs_truncated: AtomicI64,
    envs_size: AtomicI64,
}

/// Point in time view of [`Stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsReport {
    pub live_entries: i64,
    pub table_size: usize,
    pub hits: Vec<(&'static str, i64)>,
    pub added: Vec<(&'static str, i64)>,
    pub misses: i64,
    pub flushed: i64,
    pub path_errors: i64,
    pub inode_errors: i64,
    pub broken_lineage: i64,
    pub fallback_attempts: i64,
    pub fallback_throttled: i64,
    pub args_truncated: i64,
    pub args_size: i64,
    pub envs_truncated: i64,
    pub envs_size: i64,
}

impl StatsReport {
    pub fn hits(&self, source: HitSource) -> i64 {
        lookup(&self.hits, source.as_str())
    }

    pub fn added(&self, source: Source) -> i64 {
        lookup(&self.added, source.as_str())
    }
}

fn lookup(values: &[(&'static str, i64)], name: &str) -> i64 {
    values
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, value)| *value)
        .unwrap_or_default()
}

fn hit_index(source: HitSource) -> usize {
    match source {
        HitSource::Cache => 0,
        HitSource::KernelMaps => 1,
        HitSource::Procfs => 2,
    }
}

fn source_index(source: Source) -> usize {
    match source {
        Source::Event => 0,
        Source::KernelMap => 1,
        Source::Procfs => 2,
        Source::Snapshot => 3,
    }
}

fn take(counter: &AtomicI64) -> i64 {
    counter.swap(0, Ordering::Relaxed)
}

fn inc(counter: &AtomicI64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Stats {
    pub fn live_entries(&self) -> i64 {
        self.live_entries.load(Ordering::Relaxed)
    }

    pub(crate) fn entry_retained(&self) {
        inc(&self.live_entries);
    }

    pub(crate) fn entry_released(&self) {
        self.live_entries.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn hit(&self, source: HitSource) {
        inc(&self.hits[hit_index(source)]);
    }

    pub(crate) fn added(&self, source: Source) {
        inc(&self.added[source_index(source)]);
    }

    pub(crate) fn miss(&self) {
        inc(&self.misses);
    }

    pub(crate) fn flushed(&self) {
        inc(&self.flushed);
    }

    pub(crate) fn path_error(&self) {
        inc(&self.path_errors);
    }

    pub(crate) fn inode_error(&self) {
        inc(&self.inode_errors);
    }

    pub(crate) fn broken_lineage(&self) {
        inc(&self.broken_lineage);
    }

    pub(crate) fn fallback_attempt(&self) {
        inc(&self.fallback_attempts);
    }

    pub(crate) fn fallback_throttled(&self) {
        inc(&self.fallback_throttled);
    }

    pub(crate) fn args(&self, size: usize, truncated: bool) {
        self.args_size.fetch_add(size as i64, Ordering::Relaxed);
        if truncated {
            inc(&self.args_truncated);
        }
    }

    pub(crate) fn envs(&self, size: usize, truncated: bool) {
        self.envs_size.fetch_add(size as i64, Ordering::Relaxed);
        if truncated {
            inc(&self.envs_truncated);
        }
    }

    /// Read and reset every counter.
    pub fn drain(&self, table_size: usize) -> StatsReport {
        StatsReport {
            live_entries: self.live_entries(),
            table_size,
            hits: HitSource::ALL
                .iter()
                .map(|source| (source.as_str(), take(&self.hits[hit_index(*source)])))
                .collect(),
            added: Source::ALL
                .iter()
                .map(|source| (source.as_str(), take(&self.added[source_index(*source)])))
                .collect(),
            misses: take(&self.misses),
            flushed: take(&self.flushed),
            path_errors: take(&self.path_errors),
            inode_errors: take(&self.inode_errors),
            broken_lineage: take(&self.broken_lineage),
            fallback_attempts: take(&self.fallback_attempts),
            fallback_throttled: take(&self.fallback_throttled),
            args_truncated: take(&self.args_truncated),
            args_size: take(&self.args_size),
            envs_truncated: take(&self.envs_truncated),
            envs_size: take(&self.envs_size),
        }
    }
}

/// Destination of periodic stats reports.
pub trait MetricsSink: Send + Sync {
    fn send(&self, report: &StatsReport) -> anyhow::Result<()>;
}

/// Logs reports at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn send(&self, report: &StatsReport) -> anyhow::Result<()> {
        log::info!(
            "process cache: {} live, {} cached, hits {:?}, added {:?}, {} misses, {} flushed",
            report.live_entries,
            report.table_size,
            report.hits,
            report.added,
            report.misses,
            report.flushed,
        );
        log::info!(
            "process cache errors: {} path, {} inode, {} broken lineage, fallback {} tried {} throttled",
            report.path_errors,
            report.inode_errors,
            report.broken_lineage,
            report.fallback_attempts,
            report.fallback_throttled,
        );
        Ok(())
    }
}
