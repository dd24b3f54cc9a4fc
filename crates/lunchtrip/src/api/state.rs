//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthState;
use crate::config::HubConfig;
use crate::ws::LocationHub;

/// Process-scoped state built once at startup and injected into the router.
#[derive(Clone)]
pub struct AppState {
    /// Location hub shared by every stream.
    pub hub: Arc<LocationHub>,
    /// Authentication state.
    pub auth: AuthState,
    /// Keepalive ping interval for location streams.
    pub ping_interval: Duration,
    /// How long one outbound frame may block before the stream is dropped.
    pub write_timeout: Duration,
}

impl AppState {
    pub fn new(auth: AuthState, hub_config: &HubConfig) -> Self {
        Self {
            hub: Arc::new(LocationHub::new(hub_config.queue_capacity)),
            auth,
            ping_interval: hub_config.ping_interval(),
            write_timeout: hub_config.write_timeout(),
        }
    }
}
