use anyhow::{bail, Context as _, Result};
use corral_util::{config, log, stats::Stats};
use corral_worker::config::Config;
use slog::info;
use std::process;
use tokio::runtime::Runtime;

fn main() -> Result<()> {
    let args = Config::command().get_matches();
    let loaded = config::load_with(args, "corral-worker", "CORRAL", std::env::vars())?;
    let config = Config::from_bag(&loaded.bag)?;
    let log = log::logger(config.log_level);

    let Some(engine) = loaded
        .engines
        .iter()
        .find(|engine| engine.name == config.engine)
        .cloned()
    else {
        bail!("engine `{}` is not in the engine config", config.engine);
    };

    let stats = Stats::new(config.mule_prefix.clone());
    Runtime::new()
        .context("starting tokio runtime")?
        .block_on(async {
            if let Some(mule_dir) = &config.mule_dir {
                tokio::spawn(corral_util::stats::flusher(
                    stats.clone(),
                    mule_dir.clone(),
                    log.clone(),
                ));
            }
            info!(log, "started"; "config" => ?config, "pid" => process::id());

            let result = corral_worker::main(&config, engine, stats.clone(), log.clone()).await;

            if let Some(mule_dir) = &config.mule_dir {
                stats.flush(mule_dir).ok();
            }
            info!(log, "exiting");
            result
        })
}
