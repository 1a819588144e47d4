//! State transition handlers.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use rudder_core::model::Message;

/// The application logic of a state transition.
///
/// An error moves the replica to the error state of its state model.
#[async_trait]
pub trait TransitionHandler: Send + Sync + 'static {
    async fn on_transition(&self, message: &Message) -> Result<()>;
}

/// The key of a registered handler: `(state model, from, to)`.
type TransitionKey = (String, String, String);

/// The transition handlers of a participant.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    /// Handlers of individual transitions.
    handlers: HashMap<TransitionKey, Arc<dyn TransitionHandler>>,
    /// Handlers of every transition of a state model.
    defaults: HashMap<String, Arc<dyn TransitionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for the `from -> to` transition of the given state model.
    pub fn with_handler(mut self, state_model: &str, from: &str, to: &str, handler: Arc<dyn TransitionHandler>) -> Self {
        self.handlers.insert((state_model.into(), from.into(), to.into()), handler);
        self
    }

    /// Register a handler for all transitions of the given state model which have no specific handler.
    pub fn with_default(mut self, state_model: &str, handler: Arc<dyn TransitionHandler>) -> Self {
        self.defaults.insert(state_model.into(), handler);
        self
    }

    /// Get the handler of the given transition.
    pub fn get(&self, state_model: &str, from: &str, to: &str) -> Option<Arc<dyn TransitionHandler>> {
        self.handlers
            .get(&(state_model.to_string(), from.to_string(), to.to_string()))
            .or_else(|| self.defaults.get(state_model))
            .cloned()
    }

    /// The names of all state models with at least one handler.
    pub fn state_models(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .handlers
            .keys()
            .map(|(name, _, _)| name.as_str())
            .chain(self.defaults.keys().map(String::as_str))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

/// A handler which only logs the transitions it executes.
pub struct LoggingHandler;

#[async_trait]
impl TransitionHandler for LoggingHandler {
    async fn on_transition(&self, message: &Message) -> Result<()> {
        tracing::info!(
            partition = %message.partition_name,
            from = %message.from_state,
            to = %message.to_state,
            "executing state transition"
        );
        Ok(())
    }
}
