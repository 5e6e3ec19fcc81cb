#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use mesh_core::{ConnectOptions, MessageCallback, Transport, TransportError};

/// Transport that records everything it is asked to do and lets the test inject inbound messages.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<Mutex<Recorded>>,
}

#[derive(Default)]
struct Recorded {
    connected: Option<ConnectOptions>,
    subscriptions: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
    callback: Option<MessageCallback>,
    stops: usize,
    connect_delay: Duration,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose `connect` blocks for `delay`, like a slow broker handshake.
    pub fn with_connect_delay(delay: Duration) -> Self {
        let t = Self::default();
        t.inner.lock().connect_delay = delay;
        t
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().callback.is_some()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.lock().published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.lock().subscriptions.clone()
    }

    pub fn connect_options(&self) -> Option<ConnectOptions> {
        self.inner.lock().connected.clone()
    }

    pub fn stops(&self) -> usize {
        self.inner.lock().stops
    }

    /// Feed an inbound message through the registered receive callback.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        let callback = self.inner.lock().callback.clone();
        if let Some(cb) = callback {
            cb(topic, payload);
        }
    }
}

impl Transport for RecordingTransport {
    fn connect(&self, options: &ConnectOptions) -> Result<(), TransportError> {
        let delay = self.inner.lock().connect_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.inner.lock().connected = Some(options.clone());
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.inner.lock().subscriptions.push(filter.to_string());
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.inner
            .lock()
            .published
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn start(&self, on_message: MessageCallback) -> Result<(), TransportError> {
        self.inner.lock().callback = Some(on_message);
        Ok(())
    }

    fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.callback = None;
        inner.stops += 1;
    }

    fn disconnect(&self) {
        self.inner.lock().connected = None;
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
