use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::listener::{Listener, ListenerHealth};

/// Starts and stops all contract listeners as one unit.
pub struct ListenerSupervisor {
    listeners: Vec<Arc<Listener>>,
}

impl ListenerSupervisor {
    pub fn new(listeners: Vec<Arc<Listener>>) -> Self {
        Self { listeners }
    }

    /// Starts every listener. The first fatal startup error aborts the
    /// whole bring-up and propagates; listeners started before it keep
    /// running until `stop_all`.
    pub async fn start_all(&self) -> anyhow::Result<()> {
        for listener in &self.listeners {
            listener
                .start()
                .await
                .with_context(|| format!("failed to start {} listener", listener.name()))?;
        }
        info!(count = self.listeners.len(), "all listeners started");
        Ok(())
    }

    pub fn stop_all(&self) {
        for listener in &self.listeners {
            listener.stop();
        }
        info!(count = self.listeners.len(), "all listeners stopped");
    }

    pub fn health(&self) -> BTreeMap<String, ListenerHealth> {
        self.listeners
            .iter()
            .map(|listener| (listener.name().to_string(), listener.health()))
            .collect()
    }
}
