use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::sync::{mpsc, RwLock};

/// The peer handle is gone; the receiving side of its channel was dropped.
#[derive(Debug)]
pub struct ConnectionClosed;

impl Display for ConnectionClosed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection closed")
    }
}

impl Error for ConnectionClosed {}

/// Outbound side of one live connection. Cloning is cheap; the handle stays
/// valid until the connection's pump task drops the receiver.
#[derive(Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<String>,
    session_id: String,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<String>, session_id: String) -> Self {
        Self { sender, session_id }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn send(&self, payload: String) -> Result<(), ConnectionClosed> {
        self.sender
            .send(payload)
            .await
            .map_err(|_| ConnectionClosed)
    }
}

/// Process-wide registry mapping a user to their live connection. The map is
/// owned exclusively by this type; callers go through connect, disconnect and
/// lookup and never iterate or mutate the structure directly.
#[derive(Default)]
pub struct PresenceRegistry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a live connection, replacing any previous entry for the
    /// same user. The replaced handle is left to fail on its next write.
    pub async fn connect(&self, user_id: &str, handle: ConnectionHandle) {
        let mut connections = self.connections.write().await;
        connections.insert(user_id.to_string(), handle);
    }

    /// Removes the user's entry, but only while it still belongs to the
    /// given session. A stale close arriving after a reconnect is a no-op.
    pub async fn disconnect(&self, user_id: &str, session_id: &str) -> bool {
        let mut connections = self.connections.write().await;
        if connections
            .get(user_id)
            .is_some_and(|entry| entry.session_id() == session_id)
        {
            connections.remove(user_id);
            return true;
        }
        false
    }

    pub async fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        let connections = self.connections.read().await;
        connections.get(user_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn handle(session: &str) -> (ConnectionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(tx, session.to_string()), rx)
    }

    #[tokio::test]
    async fn lookup_sees_connect_immediately() {
        let registry = PresenceRegistry::new();
        let (entry, mut rx) = handle("s1");
        registry.connect("alice", entry).await;
        let found = registry.lookup("alice").await.expect("online");
        found.send("hello".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
        assert!(registry.lookup("bob").await.is_none());
    }

    #[tokio::test]
    async fn reconnect_overwrites_previous_handle() {
        let registry = PresenceRegistry::new();
        let (first, mut first_rx) = handle("s1");
        let (second, mut second_rx) = handle("s2");
        registry.connect("alice", first).await;
        registry.connect("alice", second).await;
        let current = registry.lookup("alice").await.expect("online");
        current.send("to-second".to_string()).await.unwrap();
        assert_eq!(second_rx.recv().await.as_deref(), Some("to-second"));
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_disconnect_is_ignored() {
        let registry = PresenceRegistry::new();
        let (first, _first_rx) = handle("s1");
        let (second, _second_rx) = handle("s2");
        registry.connect("alice", first).await;
        registry.connect("alice", second).await;
        assert!(!registry.disconnect("alice", "s1").await);
        assert!(registry.lookup("alice").await.is_some());
        assert!(registry.disconnect("alice", "s2").await);
        assert!(registry.lookup("alice").await.is_none());
    }

    #[tokio::test]
    async fn send_to_dropped_receiver_fails() {
        let registry = PresenceRegistry::new();
        let (entry, rx) = handle("s1");
        registry.connect("alice", entry).await;
        drop(rx);
        let stale = registry.lookup("alice").await.expect("entry kept");
        assert!(stale.send("lost".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_connects_do_not_interfere() {
        let registry = Arc::new(PresenceRegistry::new());
        let mut joins = Vec::new();
        for index in 0..16 {
            let registry = Arc::clone(&registry);
            joins.push(tokio::spawn(async move {
                let user = format!("user-{index}");
                let (entry, rx) = {
                    let (tx, rx) = mpsc::channel(1);
                    (ConnectionHandle::new(tx, format!("s-{index}")), rx)
                };
                registry.connect(&user, entry).await;
                assert!(registry.lookup(&user).await.is_some());
                drop(rx);
            }));
        }
        for join in joins {
            join.await.unwrap();
        }
        for index in 0..16 {
            assert!(registry.lookup(&format!("user-{index}")).await.is_some());
        }
    }
}
