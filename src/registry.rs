use crate::model::ServerEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Process-local map from user identity to their live connection. At
/// most one connection per user; a newer connection replaces the entry
/// and the replaced socket can no longer be targeted for push.
pub struct Registry {
    conns: Mutex<HashMap<Uuid, Entry>>,
}

struct Entry {
    conn_id: Uuid,
    tx: UnboundedSender<ServerEvent>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Store the connection and announce the user online to everyone
    /// else. Returns the connection id used to guard `unregister`.
    pub fn register(&self, user_id: Uuid, tx: UnboundedSender<ServerEvent>) -> Uuid {
        let conn_id = Uuid::new_v4();
        self.conns.lock().insert(user_id, Entry { conn_id, tx });
        self.broadcast_except(&user_id, ServerEvent::UserOnline { user_id });
        conn_id
    }

    /// Remove the mapping if it still belongs to `conn_id` and announce
    /// the user offline. A stale socket closing after it was replaced is
    /// a no-op.
    pub fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let removed = {
            let mut guard = self.conns.lock();
            match guard.get(&user_id) {
                Some(entry) if entry.conn_id == conn_id => {
                    guard.remove(&user_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.broadcast_except(&user_id, ServerEvent::UserOffline { user_id });
        }
        removed
    }

    /// Push an event to a user's live connection. Returns false when the
    /// user has no connection; the caller does not retry or queue.
    pub fn send_to_user(&self, user_id: &Uuid, event: ServerEvent) -> bool {
        let guard = self.conns.lock();
        match guard.get(user_id) {
            Some(entry) => entry.tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn is_online(&self, user_id: &Uuid) -> bool {
        self.conns.lock().contains_key(user_id)
    }

    pub fn online_users(&self) -> Vec<Uuid> {
        self.conns.lock().keys().copied().collect()
    }

    fn broadcast_except(&self, skip: &Uuid, event: ServerEvent) {
        let guard = self.conns.lock();
        for (user_id, entry) in guard.iter() {
            if user_id != skip {
                let _ = entry.tx.send(event.clone());
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn targeted_send_and_offline() {
        let registry = Registry::new();
        let user = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(user, tx);
        assert!(registry.is_online(&user));
        assert!(registry.send_to_user(&user, ServerEvent::UserOnline { user_id: user }));
        assert!(rx.recv().await.is_some());

        let absent = Uuid::new_v4();
        assert!(!registry.send_to_user(&absent, ServerEvent::UserOnline { user_id: absent }));
        assert!(!registry.is_online(&absent));
    }

    #[tokio::test]
    async fn replacement_evicts_prior_connection() {
        let registry = Registry::new();
        let user = Uuid::new_v4();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let first = registry.register(user, tx1);
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let _second = registry.register(user, tx2);

        // pushes now land on the replacement only
        assert!(registry.send_to_user(&user, ServerEvent::UserOnline { user_id: user }));
        assert!(rx2.recv().await.is_some());
        assert!(rx1.try_recv().is_err());

        // the stale socket closing must not evict the replacement
        assert!(!registry.unregister(user, first));
        assert!(registry.is_online(&user));
    }

    #[tokio::test]
    async fn presence_broadcast_reaches_other_users() {
        let registry = Registry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        registry.register(a, tx_a);
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let conn_b = registry.register(b, tx_b);

        match rx_a.recv().await {
            Some(ServerEvent::UserOnline { user_id }) => assert_eq!(user_id, b),
            other => panic!("expected online event, got {other:?}"),
        }

        assert!(registry.unregister(b, conn_b));
        match rx_a.recv().await {
            Some(ServerEvent::UserOffline { user_id }) => assert_eq!(user_id, b),
            other => panic!("expected offline event, got {other:?}"),
        }
        assert_eq!(registry.online_users(), vec![a]);
    }
}
