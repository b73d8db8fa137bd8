use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use maestro_core::events::{RouteClass, ServerEvent};
use maestro_core::ids::{SessionId, WindowId};

/// A connected UI window.
pub struct Window {
    pub id: WindowId,
    pub session_id: Option<SessionId>,
    pub tx: mpsc::Sender<String>,
}

impl Window {
    fn new(id: WindowId, tx: mpsc::Sender<String>) -> Self {
        Self { id, session_id: None, tx }
    }

    /// Subscribe to a session. A window follows at most one session at a
    /// time; subscribing replaces the previous subscription.
    pub fn set_session(&mut self, session_id: SessionId) {
        self.session_id = Some(session_id);
    }
}

/// Registry of all connected UI windows, and the delivery point for
/// outbound events: broadcast and status-class events go to every window,
/// session-class events only to subscribed windows (or nowhere).
pub struct WindowRegistry {
    windows: DashMap<WindowId, Arc<Mutex<Window>>>,
    max_send_queue: usize,
}

impl WindowRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            windows: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new window and return its ID + message receiver.
    pub fn register(&self) -> (WindowId, mpsc::Receiver<String>) {
        let id = WindowId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let window = Arc::new(Mutex::new(Window::new(id.clone(), tx)));
        self.windows.insert(id.clone(), window);
        (id, rx)
    }

    pub fn unregister(&self, id: &WindowId) {
        self.windows.remove(id);
    }

    /// Point a window at a session, replacing any previous subscription.
    pub async fn subscribe(&self, window_id: &WindowId, session_id: SessionId) {
        if let Some(window) = self.windows.get(window_id) {
            window.lock().await.set_session(session_id);
        }
    }

    pub async fn subscription(&self, window_id: &WindowId) -> Option<SessionId> {
        match self.windows.get(window_id) {
            Some(window) => window.lock().await.session_id.clone(),
            None => None,
        }
    }

    /// Send a raw message to one window. Full queues drop the message.
    pub async fn send_to(&self, window_id: &WindowId, message: String) -> bool {
        if let Some(window) = self.windows.get(window_id) {
            let tx = window.lock().await.tx.clone();
            match tx.try_send(message) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(msg)) => {
                    warn!(
                        window_id = %window_id,
                        msg_len = msg.len(),
                        "send queue full, dropping message"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        } else {
            false
        }
    }

    /// Deliver an event according to its route class. Returns the number of
    /// windows it reached; a session-class event with zero subscribers is
    /// dropped, not queued.
    pub fn deliver(&self, event: &ServerEvent) -> usize {
        let Ok(json) = serde_json::to_string(event) else {
            warn!(event_type = event.event_type(), "failed to serialize event");
            return 0;
        };

        let mut delivered = 0;
        match event.route() {
            RouteClass::Broadcast | RouteClass::Status => {
                for entry in self.windows.iter() {
                    if let Ok(window) = entry.value().try_lock() {
                        if window.tx.try_send(json.clone()).is_ok() {
                            delivered += 1;
                        }
                    }
                }
            }
            RouteClass::Session(session_id) => {
                for entry in self.windows.iter() {
                    if let Ok(window) = entry.value().try_lock() {
                        if window.session_id.as_ref() == Some(&session_id)
                            && window.tx.try_send(json.clone()).is_ok()
                        {
                            delivered += 1;
                        }
                    }
                }
            }
        }
        delivered
    }

    pub fn count(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::status::SessionStatus;

    #[test]
    fn register_and_unregister() {
        let registry = WindowRegistry::new(32);
        assert_eq!(registry.count(), 0);

        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_eq!(registry.count(), 2);

        registry.unregister(&id1);
        assert_eq!(registry.count(), 1);
        registry.unregister(&id2);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn subscribe_replaces_previous_session() {
        let registry = WindowRegistry::new(32);
        let (id, _rx) = registry.register();

        let first = SessionId::new();
        let second = SessionId::new();
        registry.subscribe(&id, first.clone()).await;
        assert_eq!(registry.subscription(&id).await, Some(first));

        registry.subscribe(&id, second.clone()).await;
        assert_eq!(registry.subscription(&id).await, Some(second));
    }

    #[tokio::test]
    async fn status_event_reaches_every_window() {
        let registry = WindowRegistry::new(32);
        let (w1, mut rx1) = registry.register();
        let (_w2, mut rx2) = registry.register();
        registry.subscribe(&w1, SessionId::new()).await;

        let event = ServerEvent::SessionStatusChanged {
            session_id: SessionId::new(),
            status: SessionStatus::Running,
        };
        let delivered = registry.deliver(&event);
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().unwrap().contains("session.status"));
        assert!(rx2.try_recv().unwrap().contains("session.status"));
    }

    #[tokio::test]
    async fn session_event_reaches_only_subscribers() {
        let registry = WindowRegistry::new(32);
        let (subscribed, mut rx1) = registry.register();
        let (other, mut rx2) = registry.register();

        let session = SessionId::new();
        registry.subscribe(&subscribed, session.clone()).await;
        registry.subscribe(&other, SessionId::new()).await;

        let event = ServerEvent::StreamMessage {
            session_id: session,
            payload: serde_json::json!({"text": "hi"}),
        };
        let delivered = registry.deliver(&event);
        assert_eq!(delivered, 1);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn session_event_with_no_subscribers_is_dropped() {
        let registry = WindowRegistry::new(32);
        let (_w, mut rx) = registry.register();

        let event = ServerEvent::StreamMessage {
            session_id: SessionId::new(),
            payload: serde_json::json!({"text": "nobody listening"}),
        };
        let delivered = registry.deliver(&event);
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_event_reaches_unsubscribed_windows() {
        let registry = WindowRegistry::new(32);
        let (_w, mut rx) = registry.register();

        let event = ServerEvent::RunnerError {
            session_id: None,
            message: "global failure".into(),
        };
        assert_eq!(registry.deliver(&event), 1);
        assert!(rx.try_recv().unwrap().contains("runner.error"));
    }

    #[tokio::test]
    async fn send_to_specific_window() {
        let registry = WindowRegistry::new(32);
        let (id, mut rx) = registry.register();

        assert!(registry.send_to(&id, "direct".into()).await);
        assert_eq!(rx.recv().await.unwrap(), "direct");

        assert!(!registry.send_to(&WindowId::new(), "nobody".into()).await);
    }

    #[tokio::test]
    async fn full_queue_drops_message() {
        let registry = WindowRegistry::new(2);
        let (id, _rx) = registry.register();

        assert!(registry.send_to(&id, "one".into()).await);
        assert!(registry.send_to(&id, "two".into()).await);
        assert!(!registry.send_to(&id, "three".into()).await);
    }
}
