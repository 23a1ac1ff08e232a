use anyhow::Result;
use clap::Parser;
use lineage::cli::{self, LineageOpts};

#[tokio::main]
async fn main() -> Result<()> {
    let options = LineageOpts::parse();

    lineage::init_logger(Some(options.log_level()));

    match lineage::daemon::lineage_run(&options).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            cli::report_error(&e);
            std::process::exit(1);
        }
    }
}
