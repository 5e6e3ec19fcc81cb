//! Command registry: command name -> handler, last registration wins.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::agent::Agent;
use crate::protocol::{truncate_id, Envelope, Payload};

/// Handler bound to one command name. Receives the agent so it can publish replies.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, agent: &Agent, sender_id: &str, message: &Payload) -> anyhow::Result<()>;
}

impl<F> CommandHandler for F
where
    F: Fn(&Agent, &str, &Payload) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, agent: &Agent, sender_id: &str, message: &Payload) -> anyhow::Result<()> {
        self(agent, sender_id, message)
    }
}

#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` (truncated) to `handler`, replacing any previous binding. Returns the replaced handler.
    pub fn register(
        &mut self,
        name: &str,
        handler: Arc<dyn CommandHandler>,
    ) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.insert(truncate_id(name), handler)
    }

    pub fn get(&self, command: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&truncate_id(command)).cloned()
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(&truncate_id(command))
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

/// What happened to one dispatched envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// No handler for the command; not an error.
    Unknown,
    /// Handler returned an error or panicked. Already logged.
    Failed,
}

/// Run `handler` for `envelope`. Errors and panics stop here and are logged.
pub fn invoke(handler: &dyn CommandHandler, agent: &Agent, envelope: &Envelope) -> DispatchOutcome {
    let result = catch_unwind(AssertUnwindSafe(|| {
        handler.handle(agent, &envelope.sender_id, &envelope.message)
    }));
    match result {
        Ok(Ok(())) => DispatchOutcome::Handled,
        Ok(Err(e)) => {
            tracing::warn!(
                sender = %envelope.sender_id,
                command = %envelope.command,
                "command handler failed: {:#}",
                e
            );
            DispatchOutcome::Failed
        }
        Err(_) => {
            tracing::error!(
                sender = %envelope.sender_id,
                command = %envelope.command,
                "command handler panicked"
            );
            DispatchOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::config::AgentConfig;
    use crate::transport::memory::MemoryBroker;
    use parking_lot::Mutex;

    fn agent() -> Agent {
        let config = AgentConfig::with_client_id("tester");
        Agent::builder(config, MemoryBroker::new().client()).build()
    }

    fn recorder(tag: &'static str, seen: Arc<Mutex<Vec<String>>>) -> Arc<dyn CommandHandler> {
        Arc::new(move |_: &Agent, sender: &str, _: &Payload| -> anyhow::Result<()> {
            seen.lock().push(format!("{}:{}", tag, sender));
            Ok(())
        })
    }

    #[test]
    fn last_registration_wins() {
        let agent = agent();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut reg = CommandRegistry::new();
        assert!(reg.register("blink", recorder("first", seen.clone())).is_none());
        assert!(reg.register("blink", recorder("second", seen.clone())).is_some());

        let env = Envelope::new("node", "blink", "");
        let handler = reg.get("blink").unwrap();
        assert_eq!(invoke(handler.as_ref(), &agent, &env), DispatchOutcome::Handled);
        assert_eq!(*seen.lock(), vec!["second:node".to_string()]);
    }

    #[test]
    fn names_are_truncated() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut reg = CommandRegistry::new();
        reg.register("temperatura_report", recorder("t", seen));
        assert!(reg.contains("temperatura_"));
        assert!(reg.contains("temperatura_report_extra"));
        assert_eq!(reg.names(), vec!["temperatura_".to_string()]);
    }

    #[test]
    fn handler_errors_are_contained() {
        let agent = agent();
        let failing: Arc<dyn CommandHandler> =
            Arc::new(|_: &Agent, _: &str, _: &Payload| -> anyhow::Result<()> {
                Err(anyhow::anyhow!("sensor offline"))
            });
        let env = Envelope::new("node", "read", "");
        assert_eq!(invoke(failing.as_ref(), &agent, &env), DispatchOutcome::Failed);
    }

    #[test]
    fn handler_panics_are_contained() {
        let agent = agent();
        let panicking: Arc<dyn CommandHandler> =
            Arc::new(|_: &Agent, _: &str, _: &Payload| -> anyhow::Result<()> { panic!("boom") });
        let env = Envelope::new("node", "read", "");
        assert_eq!(invoke(panicking.as_ref(), &agent, &env), DispatchOutcome::Failed);
    }
}
