//! Location hub: latest-known positions and presence, plus fan-out to every
//! live connection.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info};

use super::connection::{
    Connection, ConnectionId, ConnectionState, DisconnectReason, SendOutcome, Snapshot,
};
use super::registry::Registry;
use super::types::{Location, LocationSet, LocationUpdate, PresenceSet, PresenceStatus, WsEvent};

/// Default per-connection outbound queue size.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Result of ingesting a location update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored and broadcast under this version.
    Applied { version: u64 },
    /// A newer location is already stored for the user; nothing changed.
    Superseded { current: DateTime<Utc> },
}

#[derive(Debug, Default)]
struct HubState {
    version: u64,
    locations: Arc<LocationSet>,
    presence: Arc<PresenceSet>,
}

impl HubState {
    /// Copy out what a snapshot needs so it can be encoded after unlocking.
    fn capture(&self) -> PendingSnapshot {
        PendingSnapshot {
            version: self.version,
            locations: self.locations.clone(),
            presence: self.presence.clone(),
        }
    }
}

struct PendingSnapshot {
    version: u64,
    locations: Arc<LocationSet>,
    presence: Arc<PresenceSet>,
}

impl PendingSnapshot {
    fn encode(&self) -> Option<Snapshot> {
        encode(self.version, &self.locations, &self.presence)
    }
}

/// Hub shared by every WebSocket connection.
///
/// The hub state and the Registry are separate lock domains. The state lock
/// is only held to swap state and bump the version; encoding and fan-out
/// happen after it is released. Presence changes may read the Registry while
/// holding the state lock, never the other way round.
#[derive(Debug)]
pub struct LocationHub {
    registry: Registry,
    state: Mutex<HubState>,
    queue_capacity: usize,
}

impl LocationHub {
    /// Create a hub whose connections queue up to `queue_capacity` snapshots.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            registry: Registry::new(),
            state: Mutex::new(HubState::default()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build a connection for an authenticated user. It stays `Connecting`
    /// until [`LocationHub::register`] is called.
    pub fn connect(&self, user_id: &str) -> Arc<Connection> {
        Arc::new(Connection::new(user_id, self.queue_capacity))
    }

    /// Add a connection, mark its user online, and send everyone (the new
    /// connection included) the current state.
    ///
    /// The new connection never receives a snapshot older than the state at
    /// the moment it was added.
    pub fn register(&self, conn: &Arc<Connection>) -> ConnectionId {
        conn.start_at(self.version());
        let id = self.registry.add(conn.clone());

        if !conn.advance(ConnectionState::Active) || !conn.is_live() {
            // Closed before it ever became active.
            self.registry.remove(id);
            conn.close(DisconnectReason::Unregistered);
            conn.advance(ConnectionState::Closed);
            return id;
        }

        info!(
            "Registered location connection {} for user {} ({} live)",
            id,
            conn.user_id(),
            self.registry.live_len()
        );

        self.update_presence(conn.user_id(), |_| Some(PresenceStatus::Online));
        id
    }

    /// Remove a connection. Unknown or already removed ids are a no-op.
    ///
    /// When the user's last connection goes away they are marked offline.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let Some(conn) = self.registry.remove(id) else {
            return false;
        };

        conn.close(DisconnectReason::Unregistered);
        conn.advance(ConnectionState::Closed);
        info!(
            "Unregistered location connection {} for user {} ({})",
            id,
            conn.user_id(),
            conn.disconnect_reason()
                .unwrap_or(DisconnectReason::Unregistered)
        );

        self.update_presence(conn.user_id(), |connected| {
            (!connected).then_some(PresenceStatus::Offline)
        });
        true
    }

    /// Store a user's position if it is not older than the one on record,
    /// then broadcast the new set.
    pub fn ingest(&self, user_id: &str, update: LocationUpdate) -> IngestOutcome {
        let location = update.into_location(user_id);

        let snapshot = {
            let mut state = self.state();
            if let Some(current) = state.locations.get(user_id)
                && current.timestamp > location.timestamp
            {
                debug!(
                    "Ignoring stale location for user {} ({} < {})",
                    user_id, location.timestamp, current.timestamp
                );
                return IngestOutcome::Superseded {
                    current: current.timestamp,
                };
            }

            state.version += 1;
            Arc::make_mut(&mut state.locations).replace(location);
            state.capture()
        };

        let version = snapshot.version;
        if let Some(snapshot) = snapshot.encode() {
            self.fan_out(&snapshot);
        }
        IngestOutcome::Applied { version }
    }

    /// Record a focus report from a connected client.
    ///
    /// Returns the new version, or `None` when the user has no live
    /// connection (a report racing its own disconnect).
    pub fn report_activity(&self, user_id: &str, active: bool) -> Option<u64> {
        let status = if active {
            PresenceStatus::Online
        } else {
            PresenceStatus::Away
        };
        self.update_presence(user_id, |connected| connected.then_some(status))
    }

    /// Apply a presence change chosen by `decide`, which is told whether the
    /// user still has a live connection. Runs under the state lock so a
    /// concurrent register and unregister for the same user cannot reorder.
    fn update_presence(
        &self,
        user_id: &str,
        decide: impl FnOnce(bool) -> Option<PresenceStatus>,
    ) -> Option<u64> {
        let snapshot = {
            let mut state = self.state();
            let connected = !self.registry.for_user(user_id).is_empty();
            let status = decide(connected)?;

            state.version += 1;
            Arc::make_mut(&mut state.presence).set(user_id, status, Utc::now());
            debug!("User {} is now {:?}", user_id, status);
            state.capture()
        };

        let version = snapshot.version;
        if let Some(snapshot) = snapshot.encode() {
            self.fan_out(&snapshot);
        }
        Some(version)
    }

    /// Send the current state to every live connection.
    ///
    /// Returns the number of connections that accepted the snapshot.
    pub fn broadcast(&self) -> usize {
        match self.current_snapshot() {
            Some(snapshot) => self.fan_out(&snapshot),
            None => 0,
        }
    }

    fn fan_out(&self, snapshot: &Snapshot) -> usize {
        let mut delivered = 0;
        for conn in self.registry.snapshot() {
            match conn.send(snapshot.clone()) {
                SendOutcome::Queued => delivered += 1,
                SendOutcome::Replaced => {
                    debug!(
                        "Connection {} is behind; dropped its oldest snapshot",
                        conn.id()
                    );
                    delivered += 1;
                }
                SendOutcome::Stale | SendOutcome::Closed => {}
            }
        }
        delivered
    }

    fn current_snapshot(&self) -> Option<Snapshot> {
        let pending = self.state().capture();
        pending.encode()
    }

    /// Server-initiated disconnect. The connection's loops exit and its
    /// gateway task unregisters it.
    pub fn evict(&self, id: ConnectionId) -> bool {
        match self.registry.get(id) {
            Some(conn) => {
                let closed = conn.close(DisconnectReason::Evicted);
                if closed {
                    info!("Evicted connection {} for user {}", id, conn.user_id());
                }
                closed
            }
            None => false,
        }
    }

    /// Close every connection. Used on process shutdown.
    pub fn shutdown(&self) -> usize {
        let members = self.registry.snapshot();
        let closed = members
            .iter()
            .filter(|conn| conn.close(DisconnectReason::Shutdown))
            .count();
        info!("Location hub shutting down, closed {} connection(s)", closed);
        closed
    }

    /// Wait until every connection has been unregistered.
    ///
    /// Returns `false` if some were still registered after `timeout`.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let drained = async {
            while !self.registry.is_empty() {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    /// Current LocationSet.
    pub fn locations(&self) -> Arc<LocationSet> {
        self.state().locations.clone()
    }

    /// Stored location for one user.
    pub fn location(&self, user_id: &str) -> Option<Location> {
        self.state().locations.get(user_id).cloned()
    }

    /// Presence of every user seen since startup.
    pub fn presence(&self) -> Arc<PresenceSet> {
        self.state().presence.clone()
    }

    /// Version of the current state; bumps on every applied change.
    pub fn version(&self) -> u64 {
        self.state().version
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.registry.get(id)
    }

    /// Live connections opened by one user.
    pub fn user_connections(&self, user_id: &str) -> Vec<Arc<Connection>> {
        self.registry.for_user(user_id)
    }

    /// Registered connections, including ones already closing but not yet
    /// unregistered by their gateway task.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Registered connections that are still live.
    pub fn live_connection_count(&self) -> usize {
        self.registry.live_len()
    }
}

impl Default for LocationHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

fn encode(version: u64, locations: &LocationSet, presence: &PresenceSet) -> Option<Snapshot> {
    match serde_json::to_string(&WsEvent::Locations {
        version,
        body: locations,
        presence,
    }) {
        Ok(payload) => Some(Snapshot::new(version, payload)),
        Err(e) => {
            error!("Failed to encode location snapshot {}: {}", version, e);
            None
        }
    }
}
