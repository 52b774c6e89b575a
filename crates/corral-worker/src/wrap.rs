//! The sandbox lifecycle for a single job, driven through the `docker` CLI:
//! create with a named volume, copy the input in, start attached, kill on
//! demand, and tear everything down again.

use crate::dispatch::Sandbox;
use anyhow::{anyhow, bail, Context as _, Result};
use async_trait::async_trait;
use chrono::Local;
use corral_base::{EngineConfig, RESULT_ARTIFACT};
use rand::Rng as _;
use slog::{debug, error, info, Logger};
use std::{os::unix::fs::DirBuilderExt as _, path::PathBuf, process::Stdio};
use tokio::process::Command;

pub struct ContainerWrap {
    engine: EngineConfig,
    engine_id: String,
    jobs_dir: PathBuf,
    log_dir: PathBuf,
    log: Logger,
    job: Option<JobContext>,
}

struct JobContext {
    container_name: String,
    dirname: PathBuf,
}

fn create_args(engine: &EngineConfig, name: &str) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "-v".to_string(),
        format!("{name}:{}", engine.mountpoint),
        "-u".to_string(),
        engine.user.to_string(),
        "--name".to_string(),
        name.to_string(),
    ];
    args.extend(engine.run_flags.iter().cloned());
    args.extend([
        engine.image.clone(),
        "/bin/bash".to_string(),
        "-c".to_string(),
        engine.cmd.clone(),
    ]);
    args
}

fn copy_in_args(name: &str, input_filename: &str) -> Vec<String> {
    vec![
        "run".to_string(),
        "--rm".to_string(),
        "-i".to_string(),
        "-v".to_string(),
        format!("{name}:/data"),
        "busybox".to_string(),
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!("cat - > /data/{input_filename}"),
    ]
}

fn copy_out_args(name: &str) -> Vec<String> {
    vec![
        "run".to_string(),
        "--rm".to_string(),
        "-v".to_string(),
        format!("{name}:/data"),
        "busybox".to_string(),
        "cat".to_string(),
        format!("/data/{RESULT_ARTIFACT}"),
    ]
}

impl ContainerWrap {
    pub fn new(
        engine: EngineConfig,
        index: u32,
        jobs_dir: PathBuf,
        log_dir: PathBuf,
        log: Logger,
    ) -> Self {
        let engine_id = format!("{}{index}", engine.name);
        Self {
            engine,
            engine_id,
            jobs_dir,
            log_dir,
            log,
            job: None,
        }
    }

    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    fn container_log_path(&self, tag: &str) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        self.log_dir.join(format!("{tag}.log.{stamp}"))
    }

    async fn docker(&self, args: &[String]) -> Result<()> {
        debug!(self.log, "docker"; "args" => ?args);
        let status = Command::new("docker")
            .args(args)
            .status()
            .await
            .context("spawning docker")?;
        if !status.success() {
            bail!("docker {} exited with {status}", args[0]);
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for ContainerWrap {
    /// Create the container and its named volume, and the host-side job
    /// directory. Returns the host path the input file should be written
    /// to.
    async fn open_new_task(&mut self) -> Result<PathBuf> {
        let name = format!(
            "{}_{}",
            self.engine_id,
            rand::thread_rng().gen_range(0..1000)
        );
        let dirname = self.jobs_dir.join(&name);
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dirname)
            .with_context(|| format!("creating work dir `{}`", dirname.display()))?;

        self.docker(&create_args(&self.engine, &name)).await?;
        info!(self.log, "created container"; "engine_id" => &self.engine_id, "container" => &name);
        self.job = Some(JobContext {
            container_name: name,
            dirname: dirname.clone(),
        });
        Ok(dirname.join(&self.engine.input_filename))
    }

    /// Copy the input into the volume, run the container to completion with
    /// its output captured, and copy the result artifact back out. The
    /// caller owns the clock; this just waits.
    async fn run(&self) -> Result<PathBuf> {
        let job = self.job.as_ref().ok_or_else(|| anyhow!("no open task"))?;

        // `docker cp` misbehaves under user namespaces, so the copy goes
        // through a helper container that cats stdin into the volume.
        let input = std::fs::File::open(job.dirname.join(&self.engine.input_filename))
            .context("opening input file")?;
        let status = Command::new("docker")
            .args(copy_in_args(&job.container_name, &self.engine.input_filename))
            .stdin(Stdio::from(input))
            .status()
            .await
            .context("spawning docker")?;
        if !status.success() {
            bail!("copying input into the volume exited with {status}");
        }

        let capture_path = self.container_log_path(&job.container_name);
        let capture = std::fs::File::create(&capture_path).ok();
        let mut start = Command::new("docker");
        start.args(["start", "-a"]).arg(&job.container_name);
        if let Some(capture) = &capture {
            start.stdout(Stdio::from(capture.try_clone()?));
            start.stderr(Stdio::from(capture.try_clone()?));
        }
        info!(self.log, "starting container"; "container" => &job.container_name);
        let status = start.status().await.context("spawning docker")?;
        if let Some(capture) = capture {
            // Empty captures are just clutter.
            if capture.metadata().map(|meta| meta.len() == 0).unwrap_or(false) {
                std::fs::remove_file(&capture_path).ok();
            }
        }
        if !status.success() {
            bail!("container exited with {status}");
        }
        info!(self.log, "container finished"; "engine_id" => &self.engine_id);

        let result_path = job.dirname.join(RESULT_ARTIFACT);
        let out = std::fs::File::create(&result_path).context("creating result file")?;
        let status = Command::new("docker")
            .args(copy_out_args(&job.container_name))
            .stdout(Stdio::from(out))
            .status()
            .await
            .context("spawning docker")?;
        if !status.success() {
            error!(self.log, "error copying result from container";
                "container" => &job.container_name);
        }
        Ok(result_path)
    }

    /// Kill the running container. Used by the timeout path.
    async fn stop(&self) {
        let Some(job) = &self.job else { return };
        info!(self.log, "killing container"; "container" => &job.container_name);
        Command::new("docker")
            .arg("kill")
            .arg(&job.container_name)
            .status()
            .await
            .ok();
    }

    /// Remove the container, its volume, and the host job directory.
    /// Idempotent; never fails the job.
    async fn cleanup(&mut self) {
        let Some(job) = self.job.take() else { return };
        Command::new("docker")
            .args(["rm", "-v"])
            .arg(&job.container_name)
            .status()
            .await
            .ok();
        Command::new("docker")
            .args(["volume", "rm"])
            .arg(&job.container_name)
            .status()
            .await
            .ok();
        debug!(self.log, "cleaned up job dir";
            "dir" => job.dirname.display().to_string(), "engine_id" => &self.engine_id);
        std::fs::remove_dir_all(&job.dirname).ok();
    }
}
