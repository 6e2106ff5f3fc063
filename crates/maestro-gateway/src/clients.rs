use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_core::{Frame, FrameSink, MaestroError, MaestroResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// The kind of peer behind a connection. Fresh connections observe events
/// until they identify themselves as an agent or a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Agent,
    User,
    Monitor,
}

struct ClientHandle {
    tx: mpsc::Sender<Frame>,
    role: ClientRole,
    agent_id: Option<String>,
    last_seen: DateTime<Utc>,
}

struct Inner {
    clients: HashMap<String, ClientHandle>,
    /// agent id → client id, for dispatch routing.
    agents: HashMap<String, String>,
}

/// Registry of live connections. Each client owns a bounded send channel; a
/// send is always non-blocking — a full channel or a vanished client is a
/// `Transport` error, never a stall.
pub struct ClientRegistry {
    inner: RwLock<Inner>,
    send_buffer: usize,
}

impl ClientRegistry {
    pub fn new(send_buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner {
                clients: HashMap::new(),
                agents: HashMap::new(),
            }),
            send_buffer: send_buffer.max(1),
        })
    }

    /// Add a connection and return the receiving end of its send channel
    /// (drained by the connection's writer loop).
    pub async fn register(&self, client_id: &str) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.send_buffer);
        let mut inner = self.inner.write().await;
        inner.clients.insert(
            client_id.to_string(),
            ClientHandle {
                tx,
                role: ClientRole::Monitor,
                agent_id: None,
                last_seen: Utc::now(),
            },
        );
        info!(client_id, "WebSocket client connected");
        rx
    }

    /// Remove a connection, closing its send channel. Returns the agent id
    /// the client was bound to, if any, so the caller can unwind the agent
    /// registration.
    pub async fn unregister(&self, client_id: &str) -> Option<String> {
        let mut inner = self.inner.write().await;
        let handle = inner.clients.remove(client_id)?;
        if let Some(agent_id) = &handle.agent_id {
            // Only unmap if this client is still the agent's active binding.
            if inner.agents.get(agent_id) == Some(&client_id.to_string()) {
                inner.agents.remove(agent_id);
            }
        }
        debug!(client_id, "WebSocket client removed");
        handle.agent_id
    }

    /// Bind a client to an agent identity; subsequent dispatches for that
    /// agent route to this connection.
    pub async fn bind_agent(&self, client_id: &str, agent_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(handle) = inner.clients.get_mut(client_id) {
            handle.role = ClientRole::Agent;
            handle.agent_id = Some(agent_id.to_string());
        }
        inner
            .agents
            .insert(agent_id.to_string(), client_id.to_string());
    }

    pub async fn set_role(&self, client_id: &str, role: ClientRole) {
        if let Some(handle) = self.inner.write().await.clients.get_mut(client_id) {
            handle.role = role;
        }
    }

    pub async fn agent_of(&self, client_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .clients
            .get(client_id)
            .and_then(|h| h.agent_id.clone())
    }

    pub async fn touch(&self, client_id: &str) {
        if let Some(handle) = self.inner.write().await.clients.get_mut(client_id) {
            handle.last_seen = Utc::now();
        }
    }

    pub async fn send_to_client(&self, client_id: &str, frame: Frame) -> MaestroResult<()> {
        let inner = self.inner.read().await;
        let handle = inner
            .clients
            .get(client_id)
            .ok_or_else(|| MaestroError::Transport(format!("client {client_id} not connected")))?;
        handle
            .tx
            .try_send(frame)
            .map_err(|_| MaestroError::Transport(format!("send buffer full for {client_id}")))
    }

    /// Fan a frame out to every non-agent client. Slow consumers lose
    /// frames instead of blocking the fan-out.
    pub async fn broadcast_observers(&self, frame: &Frame) {
        let inner = self.inner.read().await;
        for handle in inner.clients.values() {
            if handle.role != ClientRole::Agent {
                let _ = handle.tx.try_send(frame.clone());
            }
        }
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    pub async fn last_seen(&self, client_id: &str) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .await
            .clients
            .get(client_id)
            .map(|h| h.last_seen)
    }
}

#[async_trait]
impl FrameSink for ClientRegistry {
    async fn send_to_agent(&self, agent_id: &str, frame: Frame) -> MaestroResult<()> {
        let inner = self.inner.read().await;
        let client_id = inner
            .agents
            .get(agent_id)
            .ok_or_else(|| MaestroError::Transport(format!("agent {agent_id} not connected")))?;
        let handle = inner
            .clients
            .get(client_id)
            .ok_or_else(|| MaestroError::Transport(format!("agent {agent_id} not connected")))?;
        handle
            .tx
            .try_send(frame)
            .map_err(|_| MaestroError::Transport(format!("send buffer full for agent {agent_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_bind_and_route() {
        let registry = ClientRegistry::new(8);
        let mut rx = registry.register("c-1").await;
        registry.bind_agent("c-1", "a-1").await;

        registry
            .send_to_agent("a-1", Frame::new("task.dispatch", json!({})))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().frame_type, "task.dispatch");
    }

    #[tokio::test]
    async fn test_send_to_unknown_agent_is_transport_error() {
        let registry = ClientRegistry::new(8);
        let err = registry
            .send_to_agent("ghost", Frame::new("task.dispatch", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::Transport(_)));
    }

    #[tokio::test]
    async fn test_full_send_buffer_is_transport_error() {
        let registry = ClientRegistry::new(1);
        let _rx = registry.register("c-1").await;
        registry.bind_agent("c-1", "a-1").await;

        registry
            .send_to_agent("a-1", Frame::new("one", json!({})))
            .await
            .unwrap();
        let err = registry
            .send_to_agent("a-1", Frame::new("two", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::Transport(_)));
    }

    #[tokio::test]
    async fn test_unregister_returns_bound_agent() {
        let registry = ClientRegistry::new(8);
        let _rx = registry.register("c-1").await;
        registry.bind_agent("c-1", "a-1").await;

        assert_eq!(registry.unregister("c-1").await.as_deref(), Some("a-1"));
        assert_eq!(registry.client_count().await, 0);
        assert!(registry
            .send_to_agent("a-1", Frame::new("x", json!({})))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_broadcast_skips_agents() {
        let registry = ClientRegistry::new(8);
        let mut observer_rx = registry.register("obs").await;
        let mut agent_rx = registry.register("agt").await;
        registry.bind_agent("agt", "a-1").await;

        registry
            .broadcast_observers(&Frame::new("task.completed", json!({})))
            .await;

        assert_eq!(observer_rx.recv().await.unwrap().frame_type, "task.completed");
        assert!(agent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rebind_keeps_latest_connection() {
        let registry = ClientRegistry::new(8);
        let _old = registry.register("c-old").await;
        registry.bind_agent("c-old", "a-1").await;
        let mut fresh = registry.register("c-new").await;
        registry.bind_agent("c-new", "a-1").await;

        // Dropping the old connection must not unmap the new binding.
        registry.unregister("c-old").await;
        registry
            .send_to_agent("a-1", Frame::new("task.dispatch", json!({})))
            .await
            .unwrap();
        assert_eq!(fresh.recv().await.unwrap().frame_type, "task.dispatch");
    }
}
