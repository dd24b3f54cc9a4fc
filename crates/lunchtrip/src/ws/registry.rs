//! Concurrent set of live connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::debug;

use super::connection::{Connection, ConnectionId};

#[derive(Debug)]
struct Member {
    /// Position in add order.
    seq: u64,
    conn: Arc<Connection>,
}

/// Connections keyed by connection id.
///
/// Broadcasts iterate a copy from [`Registry::snapshot`] so no shard lock is
/// held while enqueueing into connections.
///
/// A connection closed by its loops stays in the map until the gateway calls
/// [`Registry::remove`]. [`Registry::len`] counts it; [`Registry::live_len`]
/// and [`Registry::snapshot`] do not.
#[derive(Debug, Default)]
pub struct Registry {
    connections: DashMap<ConnectionId, Member>,
    next_seq: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection and return its handle.
    pub fn add(&self, conn: Arc<Connection>) -> ConnectionId {
        let id = conn.id();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(id, Member { seq, conn });
        debug!("Registry added {} ({} members)", id, self.connections.len());
        id
    }

    /// Remove a connection. Removing an absent id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(&id).map(|(_, member)| member.conn);
        if removed.is_some() {
            debug!("Registry removed {} ({} members)", id, self.connections.len());
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.conn.clone())
    }

    /// Point-in-time copy of live membership in the order members were added.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut members: Vec<(u64, Arc<Connection>)> = self
            .connections
            .iter()
            .filter(|entry| entry.conn.is_live())
            .map(|entry| (entry.seq, entry.conn.clone()))
            .collect();
        members.sort_by_key(|(seq, _)| *seq);
        members.into_iter().map(|(_, conn)| conn).collect()
    }

    /// Live connections opened by one user.
    pub fn for_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        self.snapshot()
            .into_iter()
            .filter(|conn| conn.user_id() == user_id)
            .collect()
    }

    /// Members, including closed ones awaiting removal.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Members that are still live.
    pub fn live_len(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.conn.is_live())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
