use std::sync::Arc;

use tokio::sync::broadcast;

use maestro_core::events::ServerEvent;

use crate::windows::WindowRegistry;

/// Subscribes to the engine's event broadcast and forwards each event to
/// the window registry, which applies the per-class delivery rules.
pub struct EventRouter {
    registry: Arc<WindowRegistry>,
}

impl EventRouter {
    pub fn new(registry: Arc<WindowRegistry>) -> Self {
        Self { registry }
    }

    /// Start the router. Spawns a task that drains the broadcast channel
    /// until it closes.
    pub fn start(&self, mut rx: broadcast::Receiver<ServerEvent>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        registry.deliver(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event router lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("event router channel closed");
                        break;
                    }
                }
            }
        })
    }
}
