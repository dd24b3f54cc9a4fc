//! WebSocket hub for live location sharing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Clients (browser/app)                    │
//! │  - One WebSocket per device, authenticated by token          │
//! │  - Sends location and activity frames                        │
//! │  - Receives full LocationSet + presence frames               │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │ GET /locations (upgrade)
//! ┌───────────────────────────────▼──────────────────────────────┐
//! │                       Upgrade gateway                        │
//! │  - Auth middleware rejects before any state is created       │
//! │  - Spawns read + write loop per connection                   │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────▼──────────────────────────────┐
//! │                         LocationHub                          │
//! │  - LocationSet (last writer wins by timestamp)               │
//! │  - Presence (online / away / offline, last seen)             │
//! │  - Registry of live connections (copy-out snapshots)         │
//! │  - Fan-out into bounded drop-oldest connection queues        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod connection;
mod handler;
mod hub;
mod registry;
mod types;

pub use connection::{
    Connection, ConnectionId, ConnectionState, DisconnectReason, SendOutcome, Snapshot,
};
pub use handler::locations_ws_handler;
pub use hub::{DEFAULT_QUEUE_CAPACITY, IngestOutcome, LocationHub};
pub use registry::Registry;
pub use types::{
    ActivityReport, DecodeError, InboundFrame, Location, LocationSet, LocationUpdate, Presence,
    PresenceSet, PresenceStatus, UserId, WsEvent,
};
