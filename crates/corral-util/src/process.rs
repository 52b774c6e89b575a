//! Process-level helpers shared by the long-running binaries.

use anyhow::Result;

/// "Main loop" for a signal handler. Blocks until the indicated signal
/// arrives, then returns cleanly. Binaries spawn one of these per signal in
/// their `JoinSet` so that the first signal received shuts the process down
/// with exit code zero.
pub async fn signal_handler(kind: tokio::signal::unix::SignalKind) -> Result<()> {
    tokio::signal::unix::signal(kind)?.recv().await;
    Ok(())
}
