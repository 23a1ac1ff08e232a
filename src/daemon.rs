use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use process_resolver::{
    KernelMaps, LogSink, MemoryKernelMaps, PinnedKernelMaps, ProcessResolver, ResolverConfig,
    Resolvers, ShutdownSignal, start_gc,
};
use tokio::signal::unix::{SignalKind, signal};

use crate::cli::{Command, LineageOpts};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Kernel maps pinned by the probes, or in-memory maps when none are loaded.
fn open_kernel_maps(config: &ResolverConfig) -> Arc<dyn KernelMaps> {
    match PinnedKernelMaps::open(&config.pinned_maps_path) {
        Ok(maps) => Arc::new(maps),
        Err(err) => {
            log::warn!(
                "kernel maps not found in {}, probes will not see snapshot entries: {err}",
                config.pinned_maps_path.display()
            );
            Arc::new(MemoryKernelMaps::new())
        }
    }
}

/// A resolver for the running host, populated from procfs.
pub fn start_resolver(config: ResolverConfig) -> Result<Arc<ProcessResolver>> {
    let maps = open_kernel_maps(&config);
    let resolvers = Resolvers::system(config.max_envs).context("Error reading boot time")?;
    let resolver = ProcessResolver::new(config, maps, resolvers);
    let count = resolver.snapshot().context("Error taking process snapshot")?;
    log::info!("process cache populated with {count} processes");
    Ok(Arc::new(resolver))
}

pub async fn lineage_run(options: &LineageOpts) -> Result<()> {
    log::trace!("Options: {:?}", options);

    let config = crate::config::load_resolver_config(options.config_file.as_deref())?;
    let resolver = start_resolver(config)?;

    match &options.command {
        Command::Snapshot { raw } => {
            println!("{}", resolver.to_json(*raw)?);
        }
        Command::Dot { with_args } => {
            let path = resolver.to_dot(*with_args)?;
            println!("{}", path.display());
        }
        Command::Run => run_until_signal(resolver).await?,
    }
    Ok(())
}

async fn run_until_signal(resolver: Arc<ProcessResolver>) -> Result<()> {
    let (tx_shutdown, shutdown) = ShutdownSignal::new();
    let gc = start_gc(resolver.clone(), shutdown.clone());
    let stats = tokio::spawn(report_stats(resolver, shutdown));

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sig_int.recv() => log::trace!("SIGINT received"),
        _ = sig_term.recv() => log::trace!("SIGTERM received"),
    }

    log::info!("Terminating...");
    tx_shutdown.send_signal();
    gc.await?;
    stats.await?;
    Ok(())
}

async fn report_stats(resolver: Arc<ProcessResolver>, mut shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {
                if let Err(err) = resolver.send_stats(&LogSink) {
                    log::error!("sending process cache stats failed: {err:?}");
                }
            }
        }
    }
}
