//! A single client connection and its bounded outbound queue.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::types::UserId;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection handle, allocated in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A serialized LocationSet frame shared by every recipient of one broadcast.
#[derive(Debug, Clone)]
pub struct Snapshot {
    version: u64,
    payload: Arc<str>,
}

impl Snapshot {
    pub fn new(version: u64, payload: impl Into<Arc<str>>) -> Self {
        Self {
            version,
            payload: payload.into(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// Result of enqueueing a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Appended to the queue.
    Queued,
    /// Queue was full; the oldest snapshot was dropped to make room.
    Replaced,
    /// Not newer than the last snapshot already enqueued; skipped.
    Stale,
    /// Connection is closed; nothing enqueued.
    Closed,
}

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a connection left the Active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client sent a close frame.
    ClientClosed,
    /// Inbound stream ended without a close frame.
    StreamEnded,
    /// Reading from the transport failed.
    ReadError,
    /// Writing to the transport failed.
    WriteError,
    /// Server-initiated eviction.
    Evicted,
    /// The token the stream was opened with expired.
    SessionExpired,
    /// Server is shutting down.
    Shutdown,
    /// Removed from the hub without a prior disconnect signal.
    Unregistered,
}

impl DisconnectReason {
    /// Close frame the server sends for disconnects it initiates.
    pub fn close_frame(self) -> Option<(u16, &'static str)> {
        match self {
            Self::SessionExpired => Some((4001, "session expired")),
            Self::Evicted => Some((4002, "evicted")),
            Self::Shutdown => Some((1001, "server shutting down")),
            _ => None,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ClientClosed => "client closed",
            Self::StreamEnded => "stream ended",
            Self::ReadError => "read error",
            Self::WriteError => "write error",
            Self::Evicted => "evicted",
            Self::SessionExpired => "session expired",
            Self::Shutdown => "shutdown",
            Self::Unregistered => "unregistered",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Default)]
struct Outbox {
    queue: VecDeque<Snapshot>,
    last_version: Option<u64>,
}

/// One authenticated client stream.
///
/// The broadcaster only ever calls [`Connection::send`], which never waits.
/// The write loop drains the queue through [`Connection::next_snapshot`].
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    capacity: usize,
    outbox: Mutex<Outbox>,
    ready: Notify,
    live: AtomicBool,
    state: AtomicU8,
    reason: OnceLock<DisconnectReason>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Create a connection in the `Connecting` state. Capacity is at least one.
    pub fn new(user_id: impl Into<UserId>, capacity: usize) -> Self {
        Self {
            id: ConnectionId::next(),
            user_id: user_id.into(),
            capacity: capacity.max(1),
            outbox: Mutex::new(Outbox::default()),
            ready: Notify::new(),
            live: AtomicBool::new(true),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            reason: OnceLock::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Reason recorded by the first `close` call.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.reason.get().copied()
    }

    /// Number of snapshots waiting for the write loop.
    pub fn queued(&self) -> usize {
        self.outbox().queue.len()
    }

    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a snapshot without waiting.
    ///
    /// A full queue drops its oldest entry; only the latest state matters.
    pub fn send(&self, snapshot: Snapshot) -> SendOutcome {
        if !self.is_live() {
            return SendOutcome::Closed;
        }

        let outcome = {
            let mut outbox = self.outbox();
            if outbox
                .last_version
                .is_some_and(|last| snapshot.version <= last)
            {
                return SendOutcome::Stale;
            }
            outbox.last_version = Some(snapshot.version);

            let outcome = if outbox.queue.len() >= self.capacity {
                outbox.queue.pop_front();
                SendOutcome::Replaced
            } else {
                SendOutcome::Queued
            };
            outbox.queue.push_back(snapshot);
            outcome
        };

        self.ready.notify_one();
        outcome
    }

    /// Treat every version below `version` as already delivered.
    pub(crate) fn start_at(&self, version: u64) {
        if let Some(floor) = version.checked_sub(1) {
            let mut outbox = self.outbox();
            outbox.last_version = Some(outbox.last_version.map_or(floor, |last| last.max(floor)));
        }
    }

    /// Pop the oldest queued snapshot, if any.
    pub fn try_next(&self) -> Option<Snapshot> {
        self.outbox().queue.pop_front()
    }

    /// Wait for the next snapshot. Returns `None` once the connection closes.
    pub async fn next_snapshot(&self) -> Option<Snapshot> {
        loop {
            if !self.is_live() {
                return None;
            }

            let next = self.try_next();
            if next.is_some() {
                return next;
            }

            tokio::select! {
                _ = self.ready.notified() => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Close the connection. Only the first caller wins; later calls return `false`.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        if self
            .live
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let _ = self.reason.set(reason);
        self.advance(ConnectionState::Closing);
        self.shutdown.cancel();
        self.ready.notify_waiters();
        true
    }

    /// Move the lifecycle forward to `to`. Returns `false` if already there or past it.
    pub(crate) fn advance(&self, to: ConnectionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= to as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn snap(version: u64) -> Snapshot {
        Snapshot::new(version, format!("v{version}"))
    }

    #[test]
    fn test_connection_ids_are_unique_and_ordered() {
        let a = Connection::new("u", 1);
        let b = Connection::new("u", 1);
        assert_ne!(a.id(), b.id());
        assert!(a.id() < b.id());
    }

    #[test]
    fn test_send_queues_in_order() {
        let conn = Connection::new("u1", 4);
        assert_eq!(conn.send(snap(1)), SendOutcome::Queued);
        assert_eq!(conn.send(snap(2)), SendOutcome::Queued);

        assert_eq!(conn.try_next().unwrap().version(), 1);
        assert_eq!(conn.try_next().unwrap().version(), 2);
        assert!(conn.try_next().is_none());
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let conn = Connection::new("u1", 3);
        for v in 1..=3 {
            assert_eq!(conn.send(snap(v)), SendOutcome::Queued);
        }
        assert_eq!(conn.queued(), 3);

        assert_eq!(conn.send(snap(4)), SendOutcome::Replaced);
        assert_eq!(conn.queued(), 3);

        let versions: Vec<u64> = std::iter::from_fn(|| conn.try_next())
            .map(|s| s.version())
            .collect();
        assert_eq!(versions, vec![2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let conn = Connection::new("u1", 0);
        assert_eq!(conn.capacity(), 1);
        conn.send(snap(1));
        assert_eq!(conn.send(snap(2)), SendOutcome::Replaced);
        assert_eq!(conn.try_next().unwrap().payload(), "v2");
    }

    #[test]
    fn test_stale_snapshot_is_skipped() {
        let conn = Connection::new("u1", 4);
        conn.send(snap(5));
        assert_eq!(conn.send(snap(5)), SendOutcome::Stale);
        assert_eq!(conn.send(snap(3)), SendOutcome::Stale);
        assert_eq!(conn.queued(), 1);
    }

    #[test]
    fn test_start_at_skips_older_versions() {
        let conn = Connection::new("u1", 4);
        conn.start_at(0);
        assert_eq!(conn.send(snap(0)), SendOutcome::Queued);

        let conn = Connection::new("u1", 4);
        conn.start_at(5);
        assert_eq!(conn.send(snap(4)), SendOutcome::Stale);
        assert_eq!(conn.send(snap(5)), SendOutcome::Queued);
    }

    #[test]
    fn test_close_is_idempotent() {
        let conn = Connection::new("u1", 4);
        assert!(conn.close(DisconnectReason::ReadError));
        assert!(!conn.close(DisconnectReason::WriteError));
        assert!(!conn.is_live());
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(conn.disconnect_reason(), Some(DisconnectReason::ReadError));
    }

    #[test]
    fn test_send_after_close_is_noop() {
        let conn = Connection::new("u1", 4);
        conn.close(DisconnectReason::ClientClosed);
        assert_eq!(conn.send(snap(1)), SendOutcome::Closed);
        assert_eq!(conn.queued(), 0);
    }

    #[test]
    fn test_state_only_moves_forward() {
        let conn = Connection::new("u1", 1);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.advance(ConnectionState::Active));
        assert!(!conn.advance(ConnectionState::Active));
        assert!(conn.advance(ConnectionState::Closed));
        assert!(!conn.advance(ConnectionState::Closing));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_close_frames_for_server_disconnects() {
        assert_eq!(
            DisconnectReason::Evicted.close_frame(),
            Some((4002, "evicted"))
        );
        assert_eq!(DisconnectReason::Shutdown.close_frame().unwrap().0, 1001);
        assert_eq!(
            DisconnectReason::SessionExpired.close_frame(),
            Some((4001, "session expired"))
        );
        assert!(DisconnectReason::ClientClosed.close_frame().is_none());
    }

    #[tokio::test]
    async fn test_next_snapshot_wakes_on_send() {
        let conn = Arc::new(Connection::new("u1", 4));

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.next_snapshot().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.send(snap(7));

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap().version(), 7);
    }

    #[tokio::test]
    async fn test_next_snapshot_returns_none_on_close() {
        let conn = Arc::new(Connection::new("u1", 4));

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.next_snapshot().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close(DisconnectReason::Evicted);

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());

        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
    }
}
