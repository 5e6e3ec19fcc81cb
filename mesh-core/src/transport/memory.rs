//! In-process broker. Each connected client gets its own delivery thread, so callbacks run off the
//! caller's runtime the way a network client's I/O loop would.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    topic_matches, validate_filter, ConnectOptions, Credentials, MessageCallback, Transport,
    TransportError,
};

type Delivery = (String, Vec<u8>);

struct Session {
    client_id: String,
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    next_session: u64,
    sessions: HashMap<u64, Session>,
    credentials: Option<Credentials>,
}

/// Shared broker handle. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker that refuses clients presenting other credentials.
    pub fn with_credentials(username: &str, password: &str) -> Self {
        let broker = Self::new();
        broker.state.lock().credentials = Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        broker
    }

    /// New unconnected client for this broker.
    pub fn client(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Deliver `payload` to every session with a matching filter. Returns the number of recipients.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> usize {
        let state = self.state.lock();
        let mut delivered = 0;
        for session in state.sessions.values() {
            if session.filters.iter().any(|f| topic_matches(f, topic))
                && session.tx.send((topic.to_string(), payload.to_vec())).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Client ids of the currently connected sessions.
    pub fn connected_clients(&self) -> Vec<String> {
        self.state
            .lock()
            .sessions
            .values()
            .map(|s| s.client_id.clone())
            .collect()
    }

    fn open_session(
        &self,
        options: &ConnectOptions,
    ) -> Result<(u64, mpsc::UnboundedReceiver<Delivery>), TransportError> {
        let mut state = self.state.lock();
        if let Some(expected) = &state.credentials {
            if options.credentials.as_ref() != Some(expected) {
                return Err(TransportError::Refused("bad username or password".into()));
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(
            id,
            Session {
                client_id: options.client_id.clone(),
                filters: Vec::new(),
                tx,
            },
        );
        Ok((id, rx))
    }

    fn add_filter(&self, session: u64, filter: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let s = state
            .sessions
            .get_mut(&session)
            .ok_or(TransportError::NotConnected)?;
        if !s.filters.iter().any(|f| f == filter) {
            s.filters.push(filter.to_string());
        }
        Ok(())
    }

    fn close_session(&self, session: u64) {
        self.state.lock().sessions.remove(&session);
    }
}

#[derive(Default)]
struct ClientState {
    session: Option<u64>,
    inbox: Option<mpsc::UnboundedReceiver<Delivery>>,
    worker: Option<JoinHandle<()>>,
}

/// One client connection to a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    state: Mutex<ClientState>,
}

impl MemoryTransport {
    pub fn is_connected(&self) -> bool {
        self.state.lock().session.is_some()
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, options: &ConnectOptions) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.session.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        let (session, inbox) = self.broker.open_session(options)?;
        state.session = Some(session);
        state.inbox = Some(inbox);
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        validate_filter(filter)?;
        let session = self.state.lock().session.ok_or(TransportError::NotConnected)?;
        self.broker.add_filter(session, filter)
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if self.state.lock().session.is_none() {
            return Err(TransportError::NotConnected);
        }
        self.broker.publish(topic, payload);
        Ok(())
    }

    fn start(&self, on_message: MessageCallback) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.session.is_none() {
            return Err(TransportError::NotConnected);
        }
        let mut inbox = state.inbox.take().ok_or(TransportError::AlreadyStarted)?;
        let worker = std::thread::Builder::new()
            .name("memory-transport-rx".into())
            .spawn(move || {
                while let Some((topic, payload)) = inbox.blocking_recv() {
                    on_message(topic.as_str(), payload.as_slice());
                }
            })?;
        state.worker = Some(worker);
        Ok(())
    }

    fn stop(&self) {
        let (session, worker) = {
            let mut state = self.state.lock();
            state.inbox = None;
            (state.session.take(), state.worker.take())
        };
        if let Some(session) = session {
            self.broker.close_session(session);
        }
        if let Some(worker) = worker {
            // A handler may stop the transport from the delivery thread itself.
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }

    fn disconnect(&self) {
        self.stop();
    }
}
