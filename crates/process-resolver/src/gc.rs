//! Periodic cleanup of the process table.

use std::{collections::HashSet, sync::Arc};

use bpf_common::{Pid, log_error, parsing::procfs};
use tokio::{sync::broadcast, task::JoinHandle, time::MissedTickBehavior};

use crate::{error::ResolverError, resolver::ProcessResolver};

/// Cooperative cancellation of background tasks.
pub struct ShutdownSignal {
    tx: broadcast::Sender<()>,
    rx: broadcast::Receiver<()>,
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn new() -> (ShutdownSender, ShutdownSignal) {
        let (tx, rx) = broadcast::channel(1);
        (ShutdownSender(tx.clone()), ShutdownSignal { tx, rx })
    }

    pub async fn recv(&mut self) {
        let _ = self.rx.recv().await;
    }
}

pub struct ShutdownSender(broadcast::Sender<()>);

impl ShutdownSender {
    pub fn send_signal(self) {
        let _ = self.0.send(());
    }
}

impl ProcessResolver {
    /// Delete the entries of processes no longer in procfs, along with the
    /// exited entries past their retention window.
    pub fn flush_absent(&self) -> Result<usize, ResolverError> {
        let live: HashSet<Pid> = procfs::get_running_processes()
            .map_err(ResolverError::Snapshot)?
            .into_iter()
            .collect();
        Ok(self.gc_sweep(&live))
    }
}

/// Run [`ProcessResolver::flush_absent`] every `flush_interval` until shutdown.
pub fn start_gc(resolver: Arc<ProcessResolver>, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
    let period = resolver.config().flush_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes right away
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::debug!("process cache gc stopped");
                    return;
                }
                _ = ticker.tick() => match resolver.flush_absent() {
                    Ok(flushed) => log::trace!("process cache gc flushed {flushed} entries"),
                    Err(err) => log_error("process cache gc failed", err),
                },
            }
        }
    })
}
