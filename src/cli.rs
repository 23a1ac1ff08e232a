use std::{env, path::PathBuf};

use clap::{ArgAction, Parser, Subcommand};

pub const NAME: &str = "lineage";

#[derive(Parser, Debug, Clone)]
#[clap(name = NAME)]
#[clap(about = "Process lineage cache")]
#[clap(version)]
#[clap(disable_help_subcommand = true)]
pub struct LineageOpts {
    /// INI file with a `[process-resolver]` section
    #[clap(long)]
    pub config_file: Option<PathBuf>,

    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[clap(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Snapshot the running processes and print the cache as JSON
    Snapshot {
        /// Include every field of the entries
        #[clap(long)]
        raw: bool,
    },
    /// Snapshot the running processes and write their lineage as a graphviz file
    Dot {
        /// Attach the command line of each process
        #[clap(long)]
        with_args: bool,
    },
    /// Keep the cache up to date until interrupted
    Run,
}

impl LineageOpts {
    pub fn log_level(&self) -> log::LevelFilter {
        log_level_from_verbosity_flag_count(self.verbose)
    }
}

fn log_level_from_verbosity_flag_count(num: u8) -> log::LevelFilter {
    match num {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        2..=u8::MAX => log::LevelFilter::Trace,
    }
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

pub fn report_error(e: &anyhow::Error) {
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommands_and_verbosity() {
        let opts = LineageOpts::try_parse_from(["lineage", "-vv", "snapshot", "--raw"]).unwrap();
        assert_eq!(opts.command, Command::Snapshot { raw: true });
        assert_eq!(opts.log_level(), log::LevelFilter::Trace);
        assert_eq!(opts.config_file, None);

        let opts = LineageOpts::try_parse_from([
            "lineage",
            "--config-file",
            "/etc/lineage.ini",
            "dot",
            "--with-args",
        ])
        .unwrap();
        assert_eq!(opts.command, Command::Dot { with_args: true });
        assert_eq!(opts.log_level(), log::LevelFilter::Info);
        assert_eq!(opts.config_file, Some(PathBuf::from("/etc/lineage.ini")));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(LineageOpts::try_parse_from(["lineage"]).is_err());
    }
}
