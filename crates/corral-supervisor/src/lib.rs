//! Code for the supervisor binary.
//!
//! The supervisor launches one worker process per `(engine, index)` pair
//! and runs a sentry task for each: relaunch on exit (with a crashloop
//! damper), forward stop and reload signals, and only let the process end
//! once every sentry has.

pub mod config;

use anyhow::{bail, Context as _, Result};
use config::Config;
use corral_base::EngineConfig;
use slog::{error, info, warn, Logger};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    process::Command,
    signal::unix::{signal, SignalKind},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinSet,
};

/// A worker that lived shorter than this is considered crashlooping, and
/// its relaunch waits this long.
const CRASHLOOP_WINDOW: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq)]
enum SentryMsg {
    Stop(i32),
    Reload(i32),
}

fn relaunch_delay(run_duration: Duration) -> Duration {
    if run_duration < CRASHLOOP_WINDOW {
        CRASHLOOP_WINDOW
    } else {
        Duration::ZERO
    }
}

/// The command line a sentry launches its worker with. The worker inherits
/// our stdio and reads the same config documents we did.
fn worker_command(config: &Config, engine: &str, index: u32) -> Command {
    let mut command = Command::new(&config.worker_exe);
    command
        .arg("--config-file")
        .arg(&config.config_file)
        .arg("--engine-config-file")
        .arg(&config.engine_config_file)
        .arg("--engine")
        .arg(engine)
        .arg("-i")
        .arg(index.to_string());
    command
}

fn forward_signal(pid: Option<u32>, signo: i32, log: &Logger) {
    let Some(pid) = pid else {
        return;
    };
    info!(log, "forwarding signal to worker"; "pid" => pid, "signo" => signo);
    unsafe { libc::kill(pid as libc::pid_t, signo) };
}

/// Keep one worker alive. Returns when the worker exits after a stop signal
/// was forwarded to it, or errors if the worker can't be launched at all.
async fn sentry(
    config: Arc<Config>,
    engine: String,
    index: u32,
    mut signals: UnboundedReceiver<SentryMsg>,
    log: Logger,
) -> Result<()> {
    let mut stop_seen = false;
    loop {
        info!(log, "launching worker"; "engine" => &engine, "index" => index);
        let mut child = worker_command(&config, &engine, index)
            .spawn()
            .with_context(|| format!("launching worker `{}`", config.worker_exe.display()))?;
        let pid = child.id();
        let start = Instant::now();

        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.context("waiting for worker")?;
                    info!(log, "worker exited";
                        "engine" => &engine, "index" => index, "status" => %status);
                    if stop_seen {
                        return Ok(());
                    }
                    let delay = relaunch_delay(start.elapsed());
                    if !delay.is_zero() {
                        warn!(log, "worker exited quickly; damping relaunch";
                            "engine" => &engine, "index" => index);
                        tokio::time::sleep(delay).await;
                    }
                    break;
                }
                Some(msg) = signals.recv() => {
                    match msg {
                        SentryMsg::Stop(signo) => {
                            stop_seen = true;
                            forward_signal(pid, signo, &log);
                        }
                        SentryMsg::Reload(signo) => forward_signal(pid, signo, &log),
                    }
                }
            }
        }
    }
}

/// The process-level signal listener. Each termination or reload signal is
/// fanned out to every sentry; the listener ends once a stop has been
/// fanned out.
async fn signal_listener(senders: Vec<UnboundedSender<SentryMsg>>, log: Logger) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        let msg = tokio::select! {
            _ = terminate.recv() => SentryMsg::Stop(libc::SIGTERM),
            _ = interrupt.recv() => SentryMsg::Stop(libc::SIGINT),
            _ = hangup.recv() => SentryMsg::Reload(libc::SIGHUP),
        };
        info!(log, "fanning out signal"; "msg" => ?msg);
        for sender in &senders {
            sender.send(msg).ok();
        }
        if matches!(msg, SentryMsg::Stop(_)) {
            return Ok(());
        }
    }
}

/// The main function for the supervisor. Holds until every sentry has
/// exited; a sentry that fails outright (worker binary unlaunchable) takes
/// the whole supervisor down.
pub async fn main(config: Config, engines: Vec<EngineConfig>, log: Logger) -> Result<()> {
    let config = Arc::new(config);
    let mut join_set = JoinSet::new();
    let mut senders = Vec::new();
    for engine in &engines {
        for index in 0..engine.workers {
            let (sender, receiver) = mpsc::unbounded_channel();
            senders.push(sender);
            join_set.spawn(sentry(
                config.clone(),
                engine.name.clone(),
                index,
                receiver,
                log.clone(),
            ));
        }
    }
    if senders.is_empty() {
        warn!(log, "no engines configured; nothing to supervise");
        return Ok(());
    }
    info!(log, "supervising"; "workers" => senders.len());
    tokio::spawn(signal_listener(senders, log.clone()));

    while let Some(result) = join_set.join_next().await {
        match result.expect("sentry tasks do not panic") {
            Ok(()) => {}
            Err(err) => {
                error!(log, "sentry failed"; "error" => %err);
                join_set.shutdown().await;
                bail!("a sentry failed: {err}");
            }
        }
    }
    info!(log, "all sentries exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_runs_are_damped_and_long_runs_are_not() {
        assert_eq!(relaunch_delay(Duration::from_secs(1)), CRASHLOOP_WINDOW);
        assert_eq!(
            relaunch_delay(CRASHLOOP_WINDOW - Duration::from_millis(1)),
            CRASHLOOP_WINDOW
        );
        assert_eq!(relaunch_delay(CRASHLOOP_WINDOW), Duration::ZERO);
        assert_eq!(relaunch_delay(Duration::from_secs(300)), Duration::ZERO);
    }

    #[test]
    fn workers_are_launched_with_engine_index_and_config_paths() {
        let config = Config {
            worker_exe: "/usr/local/bin/corral-worker".into(),
            config_file: "confs/corral.json".to_string(),
            engine_config_file: "confs/engines.json".to_string(),
            log_level: Default::default(),
        };
        let command = worker_command(&config, "md5", 2);
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--config-file",
                "confs/corral.json",
                "--engine-config-file",
                "confs/engines.json",
                "--engine",
                "md5",
                "-i",
                "2",
            ]
        );
        assert_eq!(
            command.as_std().get_program().to_string_lossy(),
            "/usr/local/bin/corral-worker"
        );
    }
}
