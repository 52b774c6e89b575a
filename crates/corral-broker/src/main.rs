use anyhow::{Context as _, Result};
use corral_broker::config::Config;
use corral_util::{config, log};
use slog::info;
use std::process;
use tokio::{net::TcpListener, runtime::Runtime};

fn main() -> Result<()> {
    let args = Config::command().get_matches();
    let loaded = config::load_with(args, "corral-broker", "CORRAL", std::env::vars())?;
    let config = Config::from_bag(&loaded.bag)?;
    let log = log::logger(config.log_level);
    Runtime::new()
        .context("starting tokio runtime")?
        .block_on(async {
            let listener = TcpListener::bind(config.listen)
                .await
                .context("binding listener socket")?;
            let listener_addr = listener
                .local_addr()
                .context("retrieving listener local address")?;
            info!(log, "started";
                "config" => ?config,
                "addr" => %listener_addr,
                "pid" => process::id());

            corral_broker::main(listener, config.state_dir, log.clone()).await?;
            info!(log, "exiting");
            Ok(())
        })
}
