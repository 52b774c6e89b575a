use anyhow::{Context as _, Result};
use corral_supervisor::config::Config;
use corral_util::{config, log};
use slog::info;
use std::process;
use tokio::runtime::Runtime;

fn main() -> Result<()> {
    let args = Config::command().get_matches();
    let loaded = config::load_with(args, "corral-supervisor", "CORRAL", std::env::vars())?;
    let config = Config::from_bag(&loaded.bag)?;
    let log = log::logger(config.log_level);
    Runtime::new()
        .context("starting tokio runtime")?
        .block_on(async {
            info!(log, "started"; "config" => ?config, "pid" => process::id());
            corral_supervisor::main(config, loaded.engines, log.clone()).await?;
            info!(log, "gracefully terminated");
            Ok(())
        })
}
