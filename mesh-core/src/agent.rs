//! Agent runtime: owns the transport connection, routes received payloads through the codec,
//! device registry, message log and command handlers, and hosts the heartbeat and flush tasks.
//!
//! The receive callback runs on the transport's thread; the background tasks run on the tokio
//! runtime that called [`Agent::connect`]. Devices, log and transfers share one mutex.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::commands::{self, CommandHandler, CommandRegistry, DispatchOutcome};
use crate::config::AgentConfig;
use crate::devices::DeviceRegistry;
use crate::error::{AgentError, Result};
use crate::flush;
use crate::heartbeat;
use crate::message_log::{LogEntry, MessageLog};
use crate::protocol::{
    command_topic, truncate_id, Envelope, Payload, BROADCAST_TOPIC, CMD_PING, CMD_PONG,
    CMD_TRANSFER_APPEND, CMD_TRANSFER_BEGIN, CMD_TRANSFER_END,
};
use crate::transfer::{self, ExtractAs, TransferError, TransferTable};
use crate::transport::{MessageCallback, Transport};
use crate::wire;

/// Mutable state touched by both the receive path and the background tasks.
pub(crate) struct SharedState {
    pub(crate) devices: DeviceRegistry,
    pub(crate) log: MessageLog,
    pub(crate) transfers: TransferTable,
}

/// Observer called with `(sender_id, command, message)` for every received envelope, before dispatch.
pub type MessageObserver = Arc<dyn Fn(&str, &str, &Payload) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    /// Transport is being opened; `disconnect` during this window is finished by `connect`.
    Connecting,
    Running,
    Closed,
}

struct AgentInner {
    client_id: String,
    config: AgentConfig,
    transport: Box<dyn Transport>,
    state: Mutex<SharedState>,
    commands: Mutex<CommandRegistry>,
    observer: Option<MessageObserver>,
    lifecycle: Mutex<Lifecycle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        if *self.lifecycle.get_mut() == Lifecycle::Running {
            self.transport.stop();
            self.transport.disconnect();
        }
    }
}

/// Handle to one agent. Clones share the same connection and state.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

/// Non-owning handle held by background tasks so they end when the agent is dropped.
#[derive(Clone)]
pub(crate) struct WeakAgent(Weak<AgentInner>);

impl WeakAgent {
    pub(crate) fn upgrade(&self) -> Option<Agent> {
        self.0.upgrade().map(|inner| Agent { inner })
    }
}

/// Collects handlers and the message observer before the agent is built.
pub struct AgentBuilder {
    config: AgentConfig,
    transport: Box<dyn Transport>,
    commands: Vec<(String, Arc<dyn CommandHandler>)>,
    observer: Option<MessageObserver>,
}

impl AgentBuilder {
    /// Register a command handler. Later registrations for the same name win,
    /// including over the built-in handlers.
    pub fn command<F>(self, name: &str, handler: F) -> Self
    where
        F: Fn(&Agent, &str, &Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handler(name, Arc::new(handler))
    }

    pub fn handler(mut self, name: &str, handler: Arc<dyn CommandHandler>) -> Self {
        self.commands.push((name.to_string(), handler));
        self
    }

    pub fn on_message<F>(mut self, observer: F) -> Self
    where
        F: Fn(&str, &str, &Payload) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn build(self) -> Agent {
        let client_id = self.config.resolve_client_id();
        let mut registry = CommandRegistry::new();
        if self.config.enable_pong {
            registry.register(CMD_PING, Arc::new(heartbeat::respond_to_ping));
        }
        if self.config.enable_ping {
            registry.register(CMD_PONG, Arc::new(heartbeat::record_pong));
        }
        if self.config.enable_transfers {
            registry.register(CMD_TRANSFER_BEGIN, Arc::new(on_transfer_begin));
            registry.register(CMD_TRANSFER_APPEND, Arc::new(on_transfer_append));
            registry.register(CMD_TRANSFER_END, Arc::new(on_transfer_end));
        }
        for (name, handler) in self.commands {
            registry.register(&name, handler);
        }
        let (shutdown, _) = watch::channel(false);
        Agent {
            inner: Arc::new(AgentInner {
                state: Mutex::new(SharedState {
                    devices: DeviceRegistry::new(&client_id),
                    log: MessageLog::new(),
                    transfers: TransferTable::new(),
                }),
                client_id,
                config: self.config,
                transport: self.transport,
                commands: Mutex::new(registry),
                observer: self.observer,
                lifecycle: Mutex::new(Lifecycle::Idle),
                tasks: Mutex::new(Vec::new()),
                shutdown,
            }),
        }
    }
}

impl Agent {
    pub fn builder(config: AgentConfig, transport: impl Transport + 'static) -> AgentBuilder {
        AgentBuilder {
            config,
            transport: Box::new(transport),
            commands: Vec::new(),
            observer: None,
        }
    }

    /// Agent with only the built-in handlers.
    pub fn new(config: AgentConfig, transport: impl Transport + 'static) -> Self {
        Self::builder(config, transport).build()
    }

    /// This agent's device id (at most 12 characters).
    pub fn id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SharedState> {
        self.inner.state.lock()
    }

    pub(crate) fn downgrade(&self) -> WeakAgent {
        WeakAgent(Arc::downgrade(&self.inner))
    }

    /// Register or replace a handler at runtime.
    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Agent, &str, &Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_handler(name, Arc::new(handler));
    }

    pub fn register_handler(&self, name: &str, handler: Arc<dyn CommandHandler>) {
        if self.inner.commands.lock().register(name, handler).is_some() {
            tracing::debug!(command = %truncate_id(name), "handler replaced");
        }
    }

    /// Connect, subscribe, start receiving and spawn the background tasks on the current tokio runtime.
    /// Fails with [`AgentError::Closed`] if `disconnect` was called before the connection came up.
    pub fn connect(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| AgentError::NoRuntime)?;
        self.inner.config.validate()?;
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Connecting | Lifecycle::Running => {
                    return Err(AgentError::AlreadyConnected)
                }
                Lifecycle::Closed => return Err(AgentError::Closed),
                Lifecycle::Idle => *lifecycle = Lifecycle::Connecting,
            }
        }
        if let Err(e) = self.open_transport() {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle == Lifecycle::Connecting {
                *lifecycle = Lifecycle::Idle;
            }
            return Err(e);
        }

        // Tasks are spawned under the lifecycle lock so a concurrent disconnect either
        // happens first (and is seen here) or signals tasks that already subscribed.
        let mut lifecycle = self.inner.lifecycle.lock();
        if *lifecycle == Lifecycle::Closed {
            drop(lifecycle);
            self.inner.transport.stop();
            self.inner.transport.disconnect();
            tracing::info!(client_id = %self.inner.client_id, "disconnected while connecting");
            return Err(AgentError::Closed);
        }
        *lifecycle = Lifecycle::Running;

        let config = &self.inner.config;
        let mut tasks = self.inner.tasks.lock();
        if config.enable_ping {
            tasks.push(runtime.spawn(heartbeat::run_heartbeat(
                self.downgrade(),
                config.ping_interval(),
                self.inner.shutdown.subscribe(),
            )));
        }
        if config.enable_transfers {
            tasks.push(runtime.spawn(flush::run_flush(
                self.downgrade(),
                config.flush_interval(),
                self.inner.shutdown.subscribe(),
            )));
        }
        tracing::info!(
            client_id = %self.inner.client_id,
            broker = %config.broker,
            port = config.port,
            "agent connected"
        );
        Ok(())
    }

    fn open_transport(&self) -> Result<()> {
        let transport = &self.inner.transport;
        let client_id = &self.inner.client_id;
        transport.connect(&self.inner.config.connect_options(client_id))?;
        for filter in self.inner.config.subscriptions(client_id) {
            if let Err(e) = transport.subscribe(&filter) {
                transport.disconnect();
                return Err(e.into());
            }
            tracing::debug!(topic = %filter, "subscribed");
        }
        let weak = Arc::downgrade(&self.inner);
        let on_message: MessageCallback = Arc::new(move |topic: &str, payload: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                Agent { inner }.handle_incoming(topic, payload);
            }
        });
        if let Err(e) = transport.start(on_message) {
            transport.disconnect();
            return Err(e.into());
        }
        Ok(())
    }

    /// Stop background tasks and release the connection. Idempotent; callable from any thread.
    pub fn disconnect(&self) {
        let previous = {
            let mut lifecycle = self.inner.lifecycle.lock();
            std::mem::replace(&mut *lifecycle, Lifecycle::Closed)
        };
        if previous == Lifecycle::Closed {
            return;
        }
        self.inner.shutdown.send_replace(true);
        self.inner.tasks.lock().clear();
        // A connect in progress sees `Closed` and releases the transport itself.
        if previous == Lifecycle::Running {
            self.inner.transport.stop();
            self.inner.transport.disconnect();
            tracing::info!(client_id = %self.inner.client_id, "agent disconnected");
        }
    }

    pub fn is_running(&self) -> bool {
        *self.inner.lifecycle.lock() == Lifecycle::Running
    }

    /// Connect and wait until [`Agent::disconnect`] is called.
    pub async fn run(&self) -> Result<()> {
        self.connect()?;
        let mut shutdown = self.inner.shutdown.subscribe();
        let _ = shutdown.wait_for(|stopped| *stopped).await;
        Ok(())
    }

    /// Run the agent on a dedicated OS thread with its own single-threaded runtime.
    pub fn spawn_on_thread(&self) -> Result<std::thread::JoinHandle<Result<()>>> {
        let agent = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("agent-{}", self.id()))
            .spawn(move || -> Result<()> {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(agent.run())
            })?;
        tracing::debug!(client_id = %self.id(), "agent thread started");
        Ok(handle)
    }

    /// Receive path: decode, record the sender, log, notify the observer, dispatch.
    pub fn handle_incoming(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        let envelope = wire::decode(payload);
        let is_new = {
            let mut state = self.inner.state.lock();
            let is_new = state.devices.observe(&envelope);
            state.log.append(LogEntry::from_envelope(topic, &envelope));
            is_new
        };
        if is_new {
            tracing::info!(device = %envelope.sender_id, "new device detected");
        }
        if let Some(observer) = &self.inner.observer {
            let result = catch_unwind(AssertUnwindSafe(|| {
                observer(&envelope.sender_id, &envelope.command, &envelope.message)
            }));
            if result.is_err() {
                tracing::error!(topic = %topic, "message observer panicked");
            }
        }
        self.dispatch(&envelope)
    }

    /// Run the handler registered for the envelope's command, if any.
    pub fn dispatch(&self, envelope: &Envelope) -> DispatchOutcome {
        let handler = self.inner.commands.lock().get(&envelope.command);
        match handler {
            Some(handler) => commands::invoke(handler.as_ref(), self, envelope),
            None => {
                tracing::trace!(command = %envelope.command, "no handler");
                DispatchOutcome::Unknown
            }
        }
    }

    pub fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.inner.transport.publish(topic, payload)?;
        Ok(())
    }

    pub fn publish_envelope(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        let bytes = wire::encode(envelope)?;
        self.publish(topic, &bytes)
    }

    /// Send a timestamped command to one device's command topic.
    pub fn send_command(
        &self,
        device_id: &str,
        command: &str,
        message: impl Into<Payload>,
    ) -> Result<()> {
        let envelope = Envelope::new(self.id(), command, message).stamped();
        let topic = command_topic(&truncate_id(device_id));
        self.publish_envelope(&topic, &envelope)?;
        tracing::debug!(to = %device_id, command = %envelope.command, "command sent");
        Ok(())
    }

    /// Send a timestamped command to the broadcast topic.
    pub fn broadcast(&self, command: &str, message: impl Into<Payload>) -> Result<()> {
        let envelope = Envelope::new(self.id(), command, message).stamped();
        self.publish_envelope(BROADCAST_TOPIC, &envelope)
    }

    /// Send `payload` to `destination` as a begin/append.../end sequence, each message at most
    /// `chunk_budget` encoded bytes. Returns the number of messages sent.
    pub fn transfer_file(
        &self,
        destination: &str,
        file_name: &str,
        payload: &[u8],
        chunk_budget: usize,
    ) -> Result<usize> {
        let overhead = transfer::chunk_overhead(self.id())?;
        let max_chunk = transfer::max_chunk_len(chunk_budget, overhead)?;
        let topic = command_topic(&truncate_id(destination));
        let envelopes = transfer::transfer_envelopes(self.id(), file_name, payload, max_chunk);
        for envelope in &envelopes {
            self.publish_envelope(&topic, envelope)?;
        }
        tracing::info!(
            to = %destination,
            file = %file_name,
            bytes = payload.len(),
            chunk = max_chunk,
            messages = envelopes.len(),
            "file sent"
        );
        Ok(envelopes.len())
    }

    /// Read a file from disk and send it under its basename, using the configured chunk budget.
    pub fn send_file(&self, destination: &str, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = flush::sanitize_file_name(&file_name, self.id());
        self.transfer_file(destination, &file_name, &data, self.inner.config.chunk_budget)
    }

    /// Take a finished transfer out of memory instead of waiting for the flush task.
    pub fn extract_transfer(
        &self,
        sender_id: &str,
        as_: ExtractAs,
    ) -> std::result::Result<(String, Payload), TransferError> {
        self.state().transfers.extract(&truncate_id(sender_id), as_)
    }

    /// Write one finished transfer to the output directory now.
    pub async fn flush_completed(&self) -> std::io::Result<Option<PathBuf>> {
        let output_dir = self.inner.config.output_dir.clone();
        flush::flush_once(self, &output_dir).await
    }

    /// Devices seen so far, excluding this agent.
    pub fn known_devices(&self) -> HashSet<String> {
        self.state().devices.list()
    }

    /// Copy of the received-message log.
    pub fn logs(&self) -> Vec<LogEntry> {
        self.state().log.snapshot()
    }

    /// Transfers currently held in memory (in progress or awaiting flush).
    pub fn pending_transfers(&self) -> usize {
        self.state().transfers.len()
    }
}

fn on_transfer_begin(agent: &Agent, sender_id: &str, message: &Payload) -> anyhow::Result<()> {
    let file_name = message.to_text_lossy();
    let replaced = agent.state().transfers.begin(sender_id, &file_name);
    if replaced {
        tracing::warn!(sender = %sender_id, "unfinished transfer replaced by a new one");
    }
    tracing::debug!(sender = %sender_id, file = %file_name, "transfer started");
    Ok(())
}

fn on_transfer_append(agent: &Agent, sender_id: &str, message: &Payload) -> anyhow::Result<()> {
    if !agent.state().transfers.append(sender_id, message.as_bytes()) {
        tracing::warn!(sender = %sender_id, "chunk without a transfer in progress dropped");
    }
    Ok(())
}

fn on_transfer_end(agent: &Agent, sender_id: &str, message: &Payload) -> anyhow::Result<()> {
    if agent.state().transfers.end(sender_id, message.as_bytes()) {
        tracing::debug!(sender = %sender_id, "transfer complete");
    } else {
        tracing::warn!(sender = %sender_id, "end without a transfer in progress ignored");
    }
    Ok(())
}
