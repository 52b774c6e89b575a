use anyhow::{Context as _, Result};
use clap::Parser;
use corral_client::{Client, ClientConfig};
use std::{
    fs::File,
    io::{self, Read as _, Write},
    path::PathBuf,
    process::ExitCode,
};
use tokio::runtime::Runtime;

/// The corral client. Uploads a payload to an engine, waits for the job to
/// finish, and writes the result artifact out.
#[derive(Parser)]
#[command(version)]
struct CliOptions {
    /// Engine to submit the job to.
    #[arg(short, long)]
    engine: String,

    /// Request file to upload. Standard input is used if missing.
    #[arg(short, long)]
    request: Option<PathBuf>,

    /// Response file for the artifact. Standard output is used if missing.
    #[arg(short = 's', long)]
    response: Option<PathBuf>,

    /// JSON config file: base URL, polling interval, polling attempts.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<ExitCode> {
    let options = CliOptions::parse();
    let config = match &options.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };

    let payload = match &options.request {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("reading request `{}`", path.display()))?
        }
        None => {
            let mut payload = Vec::new();
            io::stdin().lock().read_to_end(&mut payload)?;
            payload
        }
    };

    let mut out: Box<dyn Write + Send> = match &options.response {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("creating response `{}`", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };

    let client = Client::new(config, options.engine);
    let result = Runtime::new()
        .context("starting tokio runtime")?
        .block_on(client.run_job(payload, &mut *out))?;
    out.flush()?;

    if result.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("job ended with status {}: {}", result.status, result.summary);
        Ok(ExitCode::FAILURE)
    }
}
