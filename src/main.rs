use std::path::PathBuf;

use log::{error, info, LevelFilter};
use structopt::StructOpt;

use flow_aggregator::app;

#[derive(Debug, StructOpt)]
struct Opts {
    /// Log level to use
    #[structopt(long = "log", default_value = "Info")]
    log_level: LevelFilter,

    /// Path to the aggregator's YAML configuration file
    #[structopt(short = "-c", long = "--config", default_value = "/etc/flow-aggregator/flow-aggregator.conf")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let opts = Opts::from_args();

    env_logger::Builder::new().format_timestamp_millis().filter(None, opts.log_level).init();

    info!("Starting flow-aggregator");

    if let Err(e) = app::run(opts.config).await {
        error!("flow-aggregator exited with error: {}", e);
        std::process::exit(1);
    }

    info!("flow-aggregator stopped");
}
