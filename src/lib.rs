//! Lineage keeps a cache of the processes running on the machine, with the
//! parent chain of each one, fed by the process probes and by procfs.
//!
//! The cache itself lives in the [`process_resolver`] crate. This crate is
//! the command line around it:
//!
//! ```sh
//! # Print the cache built from procfs
//! lineage snapshot
//!
//! # Write the process tree as a graphviz file
//! lineage dot --with-args
//!
//! # Keep the cache up to date until interrupted
//! lineage --config-file /var/lib/lineage/lineage.ini run
//! ```

pub mod cli;
pub mod config;
pub mod daemon;

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder().filter_level(level_filter).init();
    }
}
