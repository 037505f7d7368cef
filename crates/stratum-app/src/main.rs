//! Binary entrypoint: loads configuration, builds the services, and runs the
//! operation queue until Ctrl-C.

use clap::Parser;
use stratum_app::{AppResult, Cli, run_app};

#[tokio::main]
async fn main() -> AppResult<()> {
    run_app(Cli::parse()).await
}
