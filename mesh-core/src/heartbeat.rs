//! Heartbeat: periodic ping broadcast plus the built-in ping/pong handlers.
//! Liveness advertisement only: nothing tracks replies or expires silent peers.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::agent::{Agent, WeakAgent};
use crate::protocol::{Envelope, Payload, BROADCAST_TOPIC, CMD_PING, CMD_PONG};

pub fn ping_envelope(self_id: &str) -> Envelope {
    Envelope::new(self_id, CMD_PING, Payload::default()).stamped()
}

pub fn pong_message(self_id: &str) -> String {
    format!("{} says pong", self_id)
}

/// Built-in `ping` handler: answer the sender directly.
pub fn respond_to_ping(agent: &Agent, sender_id: &str, _message: &Payload) -> anyhow::Result<()> {
    agent.send_command(sender_id, CMD_PONG, pong_message(agent.id()))?;
    tracing::debug!(peer = %sender_id, "answered ping");
    Ok(())
}

/// Built-in `pong` handler.
pub fn record_pong(_agent: &Agent, sender_id: &str, message: &Payload) -> anyhow::Result<()> {
    tracing::debug!(peer = %sender_id, "pong: {}", message.to_text_lossy());
    Ok(())
}

/// Broadcast a ping now and every `period` after, until shutdown or the agent is dropped.
pub(crate) async fn run_heartbeat(
    agent: WeakAgent,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow_and_update() {
        return;
    }
    tracing::info!("starting heartbeat with period {:?}", period);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(agent) = agent.upgrade() else { break };
                let ping = ping_envelope(agent.id());
                match agent.publish_envelope(BROADCAST_TOPIC, &ping) {
                    Ok(()) => tracing::debug!("ping broadcast"),
                    Err(e) => tracing::warn!("ping broadcast failed: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("heartbeat stopped");
}
