//! Flush: persist finished transfers to the output directory and release their memory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::agent::{Agent, WeakAgent};
use crate::transfer::MAX_FLUSH_ATTEMPTS;

/// Reduce a sender-supplied file name to a bare basename. Empty or dot names get a name derived from the sender.
pub fn sanitize_file_name(file_name: &str, sender_id: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match base {
        "" | "." | ".." => format!("{}_transfer.bin", sender_id),
        name => name.to_string(),
    }
}

/// Write one finished transfer, if any. The file is written without holding the state lock;
/// the entry is dropped only after the write succeeds. A failed write is counted against the
/// entry so other finished transfers go first on the next call.
pub async fn flush_once(agent: &Agent, output_dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let Some(done) = agent.state().transfers.next_completed() else {
        return Ok(None);
    };
    let path = output_dir.join(sanitize_file_name(&done.file_name, &done.sender_id));
    if let Err(e) = write_file(output_dir, &path, done.data.as_slice()).await {
        if agent.state().transfers.record_flush_failure(&done) {
            tracing::error!(
                sender = %done.sender_id,
                file = %path.display(),
                attempts = MAX_FLUSH_ATTEMPTS,
                "giving up on transfer"
            );
        }
        return Err(e);
    }
    agent.state().transfers.release(&done);
    tracing::info!(
        sender = %done.sender_id,
        file = %path.display(),
        bytes = done.data.len(),
        "transfer saved"
    );
    Ok(Some(path))
}

async fn write_file(output_dir: &Path, path: &Path, data: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(output_dir).await?;
    tokio::fs::write(path, data).await
}

/// Flush at most one finished transfer per tick until shutdown or the agent is dropped.
pub(crate) async fn run_flush(agent: WeakAgent, period: Duration, mut shutdown: watch::Receiver<bool>) {
    if *shutdown.borrow_and_update() {
        return;
    }
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(agent) = agent.upgrade() else { break };
                let output_dir = agent.config().output_dir.clone();
                if let Err(e) = flush_once(&agent, &output_dir).await {
                    tracing::error!(dir = %output_dir.display(), "failed to save transfer: {}", e);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("flush task stopped");
}
