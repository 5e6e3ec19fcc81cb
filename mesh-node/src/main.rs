// Mesh agent demo: a controller and a sensor node talking through the in-process broker.

mod config;

use std::time::Duration;

use anyhow::Context;
use mesh_core::{Agent, MemoryBroker, Payload};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("mesh-node {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    let level = config::log_level(&cfg);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
    for warning in &cfg.warnings {
        tracing::warn!("{}", warning);
    }

    cfg.controller.validate().context("controller config")?;
    cfg.node.validate().context("node config")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let broker = MemoryBroker::new();

    let node = Agent::builder(cfg.node, broker.client())
        .command("ligar_luz", |agent: &Agent, sender: &str, _: &Payload| {
            tracing::info!(device = %agent.id(), "light on");
            agent.send_command(sender, "luz_status", "on")?;
            Ok(())
        })
        .command("ler_temperatura", |agent: &Agent, sender: &str, _: &Payload| {
            let reading = serde_json::json!({ "valor": 23.5, "unidade": "C" });
            agent.send_command(sender, "temperatura_report", reading.to_string())?;
            Ok(())
        })
        .build();

    let controller = Agent::builder(cfg.controller, broker.client())
        .command("temperatura_report", |_: &Agent, sender: &str, msg: &Payload| {
            let reading: serde_json::Value = serde_json::from_slice(msg.as_bytes())?;
            tracing::info!(device = %sender, valor = %reading["valor"], unidade = %reading["unidade"], "temperature");
            Ok(())
        })
        .command("luz_status", |_: &Agent, sender: &str, msg: &Payload| {
            tracing::info!(device = %sender, status = %msg.to_text_lossy(), "light status");
            Ok(())
        })
        .on_message(|sender: &str, command: &str, msg: &Payload| {
            tracing::debug!(from = %sender, command = %command, bytes = msg.len(), "message");
        })
        .build();

    controller.connect()?;
    node.connect()?;

    let readings: String = (0..40)
        .map(|i| format!("{},{:.1}\n", i, 21.0 + (i % 7) as f64 * 0.5))
        .collect();
    let budget = node.config().chunk_budget;
    node.transfer_file(controller.id(), "leituras.csv", readings.as_bytes(), budget)?;

    let mut rounds = tokio::time::interval(Duration::from_secs(cfg.round_period.max(1)));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = rounds.tick() => {
                controller.send_command(node.id(), "ligar_luz", "")?;
                controller.send_command(node.id(), "ler_temperatura", "")?;
                tracing::info!(devices = ?controller.known_devices(), "known devices");
            }
            res = &mut shutdown => {
                res?;
                break;
            }
        }
    }

    tracing::info!(
        controller_log = controller.logs().len(),
        node_log = node.logs().len(),
        "shutting down"
    );
    controller.disconnect();
    node.disconnect();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
