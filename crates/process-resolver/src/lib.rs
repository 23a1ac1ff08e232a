//! Process lineage cache.
//!
//! Keeps an entry per running process, built from fork, exec and exit events,
//! and resolves processes the events did not cover from the kernel maps
//! filled by the probes or from procfs.

pub mod args_envs;
pub mod config;
pub mod dump;
pub mod entry;
pub mod error;
pub mod gc;
pub mod interner;
pub mod kernel_maps;
pub mod limiter;
pub mod pool;
pub mod record;
pub mod resolver;
pub mod resolvers;
pub mod snapshot;
pub mod stats;
pub mod table;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{ModuleConfig, ResolverConfig};
pub use entry::{ProcessEntry, Source};
pub use error::{ExecError, ResolverError};
pub use gc::{ShutdownSender, ShutdownSignal, start_gc};
pub use kernel_maps::{KernelMaps, MemoryKernelMaps, PinnedKernelMaps};
pub use pool::ProcessRef;
pub use resolver::{CredentialsChange, NewEntry, ProcessResolver, Resolution, SnapshotState};
pub use resolvers::Resolvers;
pub use stats::{HitSource, LogSink, MetricsSink, StatsReport};
