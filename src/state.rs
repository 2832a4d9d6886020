use std::sync::Arc;
use std::time::Instant;

use crate::health::HealthMonitor;
use crate::mux::Multiplexer;

/// Shared state for the health API, passed to route handlers via
/// `axum::extract::State`. Holds non-owning references to the core
/// components; ownership stays with `main`.
pub struct AppState {
    pub mux: Arc<Multiplexer>,
    pub health: Arc<HealthMonitor>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(mux: Arc<Multiplexer>, health: Arc<HealthMonitor>) -> Arc<Self> {
        Arc::new(Self {
            mux,
            health,
            started_at: Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
