//! A small round-robin pool of [`Client`]s: a fixed set of independently
//! managed worker connections, picked by a simple counter rather than a
//! queue, since each `Client` already serializes its own connection
//! lifecycle.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::client::Client;

/// Round-robins calls across a fixed set of clients, each with its own
/// spawned worker (or socket connection). Unlike `AppRuntimePool`'s
/// keyed reuse map, members here are not named: callers who need
/// affinity should hold onto a single [`Client`] directly instead.
pub struct ClientPool {
    members: Vec<Client>,
    next: AtomicUsize,
}

impl ClientPool {
    pub fn new(members: Vec<Client>) -> Self {
        assert!(!members.is_empty(), "ClientPool requires at least one member");
        Self { members, next: AtomicUsize::new(0) }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Picks the next client in round-robin order.
    pub fn next(&self) -> &Client {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.members.len();
        &self.members[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.members.iter()
    }

    /// Closes every member's transport (e.g. on host shutdown).
    pub async fn close_all(&self) {
        for client in &self.members {
            client.close().await;
        }
    }
}
