//! Handling of a single delivery, factored over traits for the sandbox and
//! the front-end so that the sequencing and the timeout race can be driven
//! with fakes.

use anyhow::Result;
use async_trait::async_trait;
use corral_util::stats::Stats;
use slog::{error, info, warn, Logger};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

/// One job's sandbox. The production implementation drives the container
/// runtime; tests substitute fakes.
#[async_trait]
pub trait Sandbox: Send {
    /// Prepare a fresh sandbox and return the path the input file must be
    /// written to.
    async fn open_new_task(&mut self) -> Result<PathBuf>;

    /// Run the sandbox to completion and return the path of the result
    /// artifact. No timeout is enforced here; the caller owns the clock.
    async fn run(&self) -> Result<PathBuf>;

    /// Kill the running sandbox.
    async fn stop(&self);

    /// Tear the sandbox down. Idempotent.
    async fn cleanup(&mut self);
}

/// The worker's HTTP surface to the front-end.
#[async_trait]
pub trait FrontendClient: Send + Sync {
    async fn fetch_input(&self, jid: &str, dest: &Path) -> Result<()>;
    async fn put_result(&self, jid: &str, artifact: Vec<u8>) -> Result<()>;
    async fn put_error(&self, jid: &str, msg: &str) -> Result<()>;
}

/// Handle one delivery from claim to disposition. The caller acks
/// afterwards no matter what happened here; acking is about the message,
/// not the job.
pub async fn handle_delivery(
    sandbox: &mut impl Sandbox,
    frontend: &impl FrontendClient,
    engine_name: &str,
    timeout: u64,
    stats: &Stats,
    log: &Logger,
    body: &str,
) {
    if body.parse::<i64>().is_err() {
        // Dead letters aren't retained; log it and let the ack discard it.
        warn!(log, "discarding message with unparseable body"; "body" => body);
        return;
    }
    info!(log, "working on job"; "job" => body);
    stats.inc(format!("{engine_name}.job_started"));
    stats.inc(format!("job_completion.started.{engine_name}"));
    if let Err(msg) = run_one(sandbox, frontend, engine_name, timeout, stats, log, body).await {
        job_error(frontend, log, body, &msg).await;
    }
}

async fn run_one(
    sandbox: &mut impl Sandbox,
    frontend: &impl FrontendClient,
    engine_name: &str,
    timeout: u64,
    stats: &Stats,
    log: &Logger,
    body: &str,
) -> Result<(), String> {
    let input_path = match sandbox.open_new_task().await {
        Ok(path) => path,
        Err(err) => {
            error!(log, "error opening task"; "job" => body, "error" => %err);
            return Err("Error creating job".to_string());
        }
    };
    let result =
        run_prepared(sandbox, frontend, engine_name, timeout, stats, log, body, &input_path).await;
    // Cleanup runs on every exit path once a task was opened.
    sandbox.cleanup().await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_prepared(
    sandbox: &impl Sandbox,
    frontend: &impl FrontendClient,
    engine_name: &str,
    timeout: u64,
    stats: &Stats,
    log: &Logger,
    body: &str,
    input_path: &Path,
) -> Result<(), String> {
    if let Err(err) = frontend.fetch_input(body, input_path).await {
        error!(log, "error fetching job input"; "job" => body, "error" => %err);
        return Err("Error generating job".to_string());
    }

    info!(log, "running job"; "job" => body);
    let run = sandbox.run();
    tokio::pin!(run);
    let timeout_timer = tokio::time::sleep(Duration::from_secs(timeout));
    tokio::pin!(timeout_timer);
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_PERIOD,
        HEARTBEAT_PERIOD,
    );

    loop {
        tokio::select! {
            result = &mut run => {
                return match result {
                    Ok(result_path) => {
                        send_result(frontend, engine_name, stats, log, body, &result_path).await
                    }
                    Err(err) => {
                        error!(log, "error running job"; "job" => body, "error" => %err);
                        stats.inc(format!("{engine_name}.error.running"));
                        stats.inc(format!("job_completion.error.running.{engine_name}"));
                        Err("Error running job".to_string())
                    }
                };
            }
            _ = &mut timeout_timer, if timeout != 0 => {
                stats.inc(format!("{engine_name}.job_timeout"));
                stats.inc(format!("job_completion.timeout.{engine_name}"));
                error!(log, "job timed out"; "job" => body);
                sandbox.stop().await;
                return Err("Job timed out".to_string());
            }
            _ = heartbeat.tick() => {
                stats.inc(format!("{engine_name}.heartbeat"));
                info!(log, "heartbeat"; "job" => body);
            }
        }
    }
}

async fn send_result(
    frontend: &impl FrontendClient,
    engine_name: &str,
    stats: &Stats,
    log: &Logger,
    body: &str,
    result_path: &Path,
) -> Result<(), String> {
    info!(log, "got result for job"; "job" => body);
    let artifact = match tokio::fs::read(result_path).await {
        Ok(artifact) => artifact,
        Err(err) => {
            error!(log, "error opening result file"; "job" => body, "error" => %err);
            stats.inc(format!("{engine_name}.error.result_processing"));
            stats.inc(format!("job_completion.error.result_processing.{engine_name}"));
            return Err("Error processing result".to_string());
        }
    };
    if let Err(err) = frontend.put_result(body, artifact).await {
        error!(log, "error sending result"; "job" => body, "error" => %err);
        stats.inc(format!("{engine_name}.error.send_result"));
        stats.inc(format!("job_completion.error.send_result.{engine_name}"));
        return Err("Error processing result".to_string());
    }
    info!(log, "result sent to server"; "job" => body);
    stats.inc(format!("{engine_name}.job_success"));
    stats.inc(format!("job_completion.success.{engine_name}"));
    Ok(())
}

/// Report a failed job to the front-end. Best effort: if this PUT fails
/// too, the job stays non-terminal in the index and polling clients see
/// Running until someone looks.
async fn job_error(frontend: &impl FrontendClient, log: &Logger, body: &str, msg: &str) {
    error!(log, "job terminated with error"; "job" => body, "error" => msg);
    if let Err(err) = frontend.put_error(body, msg).await {
        error!(log, "error reporting job failure"; "job" => body, "error" => %err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use slog::o;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Copy)]
    enum RunBehavior {
        Finish,
        Fail,
        Hang,
        MissingResult,
    }

    struct FakeSandbox {
        dir: tempfile::TempDir,
        fail_open: bool,
        run_behavior: RunBehavior,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl FakeSandbox {
        fn new(run_behavior: RunBehavior) -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                fail_open: false,
                run_behavior,
                calls: Arc::default(),
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        async fn open_new_task(&mut self) -> Result<PathBuf> {
            self.calls.lock().unwrap().push("open");
            if self.fail_open {
                return Err(anyhow!("docker create failed"));
            }
            Ok(self.dir.path().join("input"))
        }

        async fn run(&self) -> Result<PathBuf> {
            self.calls.lock().unwrap().push("run");
            match self.run_behavior {
                RunBehavior::Finish => {
                    let path = self.dir.path().join("result");
                    std::fs::write(&path, b"out").unwrap();
                    Ok(path)
                }
                RunBehavior::Fail => Err(anyhow!("container exited with 1")),
                RunBehavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(anyhow!("killed"))
                }
                RunBehavior::MissingResult => Ok(self.dir.path().join("result")),
            }
        }

        async fn stop(&self) {
            self.calls.lock().unwrap().push("stop");
        }

        async fn cleanup(&mut self) {
            self.calls.lock().unwrap().push("cleanup");
        }
    }

    #[derive(Debug, PartialEq)]
    enum Put {
        Result(String, Vec<u8>),
        Error(String, String),
    }

    #[derive(Default)]
    struct FakeFrontend {
        input: Vec<u8>,
        fail_fetch: bool,
        fail_put_result: bool,
        puts: Mutex<Vec<Put>>,
    }

    #[async_trait]
    impl FrontendClient for FakeFrontend {
        async fn fetch_input(&self, _jid: &str, dest: &Path) -> Result<()> {
            if self.fail_fetch {
                return Err(anyhow!("404"));
            }
            std::fs::write(dest, &self.input)?;
            Ok(())
        }

        async fn put_result(&self, jid: &str, artifact: Vec<u8>) -> Result<()> {
            if self.fail_put_result {
                return Err(anyhow!("connection refused"));
            }
            self.puts
                .lock()
                .unwrap()
                .push(Put::Result(jid.to_string(), artifact));
            Ok(())
        }

        async fn put_error(&self, jid: &str, msg: &str) -> Result<()> {
            self.puts
                .lock()
                .unwrap()
                .push(Put::Error(jid.to_string(), msg.to_string()));
            Ok(())
        }
    }

    fn test_log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    async fn drive(
        sandbox: &mut FakeSandbox,
        frontend: &FakeFrontend,
        timeout: u64,
    ) -> Arc<Stats> {
        let stats = Stats::new("");
        handle_delivery(sandbox, frontend, "md5", timeout, &stats, &test_log(), "5").await;
        stats
    }

    #[tokio::test]
    async fn success_puts_the_result_and_cleans_up() {
        let mut sandbox = FakeSandbox::new(RunBehavior::Finish);
        let frontend = FakeFrontend {
            input: b"payload".to_vec(),
            ..Default::default()
        };
        let stats = drive(&mut sandbox, &frontend, 0).await;

        assert_eq!(
            *frontend.puts.lock().unwrap(),
            [Put::Result("5".to_string(), b"out".to_vec())]
        );
        assert_eq!(sandbox.calls(), ["open", "run", "cleanup"]);
        assert_eq!(
            std::fs::read(sandbox.dir.path().join("input")).unwrap(),
            b"payload"
        );
        let snapshot = stats.snapshot();
        assert!(snapshot.contains("md5.job_started 1"));
        assert!(snapshot.contains("md5.job_success 1"));
        assert!(snapshot.contains("job_completion.success.md5 1"));
    }

    #[tokio::test]
    async fn open_failure_reports_without_cleanup() {
        let mut sandbox = FakeSandbox::new(RunBehavior::Finish);
        sandbox.fail_open = true;
        let frontend = FakeFrontend::default();
        drive(&mut sandbox, &frontend, 0).await;

        assert_eq!(
            *frontend.puts.lock().unwrap(),
            [Put::Error("5".to_string(), "Error creating job".to_string())]
        );
        assert_eq!(sandbox.calls(), ["open"]);
    }

    #[tokio::test]
    async fn fetch_failure_reports_and_cleans_up() {
        let mut sandbox = FakeSandbox::new(RunBehavior::Finish);
        let frontend = FakeFrontend {
            fail_fetch: true,
            ..Default::default()
        };
        drive(&mut sandbox, &frontend, 0).await;

        assert_eq!(
            *frontend.puts.lock().unwrap(),
            [Put::Error("5".to_string(), "Error generating job".to_string())]
        );
        assert_eq!(sandbox.calls(), ["open", "cleanup"]);
    }

    #[tokio::test]
    async fn run_failure_reports_error_running() {
        let mut sandbox = FakeSandbox::new(RunBehavior::Fail);
        let frontend = FakeFrontend::default();
        let stats = drive(&mut sandbox, &frontend, 0).await;

        assert_eq!(
            *frontend.puts.lock().unwrap(),
            [Put::Error("5".to_string(), "Error running job".to_string())]
        );
        assert_eq!(sandbox.calls(), ["open", "run", "cleanup"]);
        assert!(stats.snapshot().contains("md5.error.running 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_stops_the_sandbox_and_reports() {
        let mut sandbox = FakeSandbox::new(RunBehavior::Hang);
        let frontend = FakeFrontend::default();
        let stats = drive(&mut sandbox, &frontend, 1).await;

        assert_eq!(
            *frontend.puts.lock().unwrap(),
            [Put::Error("5".to_string(), "Job timed out".to_string())]
        );
        assert_eq!(sandbox.calls(), ["open", "run", "stop", "cleanup"]);
        assert!(stats.snapshot().contains("md5.job_timeout 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn no_timeout_means_the_job_can_outlive_the_heartbeat() {
        let mut sandbox = FakeSandbox::new(RunBehavior::Hang);
        let frontend = FakeFrontend::default();

        // With timeout disabled the only thing that ends the job is the
        // run itself; cap the wait so a regression doesn't hang the test.
        let stats = Stats::new("");
        let outcome = tokio::time::timeout(
            Duration::from_secs(3700),
            handle_delivery(&mut sandbox, &frontend, "md5", 0, &stats, &test_log(), "5"),
        )
        .await;
        assert!(outcome.is_ok());
        // The hung run eventually returned an error of its own.
        assert_eq!(
            *frontend.puts.lock().unwrap(),
            [Put::Error("5".to_string(), "Error running job".to_string())]
        );
        assert!(stats.snapshot().contains("md5.heartbeat"));
    }

    #[tokio::test]
    async fn unreadable_result_reports_result_processing() {
        let mut sandbox = FakeSandbox::new(RunBehavior::MissingResult);
        let frontend = FakeFrontend::default();
        let stats = drive(&mut sandbox, &frontend, 0).await;

        assert_eq!(
            *frontend.puts.lock().unwrap(),
            [Put::Error("5".to_string(), "Error processing result".to_string())]
        );
        assert!(stats.snapshot().contains("md5.error.result_processing 1"));
    }

    #[tokio::test]
    async fn failed_send_promotes_the_job_to_failed() {
        let mut sandbox = FakeSandbox::new(RunBehavior::Finish);
        let frontend = FakeFrontend {
            fail_put_result: true,
            ..Default::default()
        };
        let stats = drive(&mut sandbox, &frontend, 0).await;

        assert_eq!(
            *frontend.puts.lock().unwrap(),
            [Put::Error("5".to_string(), "Error processing result".to_string())]
        );
        assert!(stats.snapshot().contains("md5.error.send_result 1"));
    }

    #[tokio::test]
    async fn unparseable_bodies_are_dropped_before_any_work() {
        let mut sandbox = FakeSandbox::new(RunBehavior::Finish);
        let frontend = FakeFrontend::default();
        let stats = Stats::new("");
        handle_delivery(
            &mut sandbox,
            &frontend,
            "md5",
            0,
            &stats,
            &test_log(),
            "not-a-jid",
        )
        .await;

        assert!(sandbox.calls().is_empty());
        assert!(frontend.puts.lock().unwrap().is_empty());
        assert_eq!(stats.snapshot(), "");
    }
}
