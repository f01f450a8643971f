pub mod embedded;
pub mod ws;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;

use crate::core::Core;

/// Shared state for the HTTP/WebSocket surface: the daemon core plus
/// live-connection accounting for the idle-exit policy.
pub struct ServerState {
    pub core: Arc<Core>,
    live_connections: AtomicUsize,
    /// Last instant the daemon had zero connections (or started).
    idle_since: Mutex<Instant>,
}

impl ServerState {
    pub fn new(core: Arc<Core>) -> Arc<ServerState> {
        Arc::new(ServerState {
            core,
            live_connections: AtomicUsize::new(0),
            idle_since: Mutex::new(Instant::now()),
        })
    }

    pub fn connection_opened(&self) {
        self.live_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub fn connection_closed(&self) {
        self.live_connections.fetch_sub(1, Ordering::AcqRel);
        *self.idle_since.lock().unwrap() = Instant::now();
    }

    pub fn live(&self) -> usize {
        self.live_connections.load(Ordering::Acquire)
    }

    /// How long the daemon has been without connections. Zero while any
    /// connection is live.
    pub fn idle_for(&self) -> Duration {
        if self.live() > 0 {
            return Duration::ZERO;
        }
        self.idle_since.lock().unwrap().elapsed()
    }
}

/// The daemon's whole HTTP surface: the WebSocket endpoint at `/` and
/// the embedded control page for everything else.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(ws::ws_upgrade))
        .route("/control.html", get(embedded::serve_embedded))
        .fallback(embedded::serve_embedded)
        .with_state(state)
}
