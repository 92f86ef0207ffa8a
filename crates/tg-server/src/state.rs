//! Application state shared across all handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tg_core::{SystemClock, TollgateConfig};
use tg_session::SessionRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub start_time: Instant,
    pub keep_alive: Duration,
    pub subscribe_timeout: Duration,
}

impl AppState {
    pub fn new(config: TollgateConfig) -> Self {
        Self::with_registry(Arc::new(SessionRegistry::new(config, Arc::new(SystemClock))))
    }

    pub fn with_registry(registry: Arc<SessionRegistry>) -> Self {
        let config = registry.config();
        Self {
            keep_alive: Duration::from_secs(config.server.keep_alive_secs.max(1)),
            subscribe_timeout: config.stream.subscribe_timeout(),
            start_time: Instant::now(),
            registry,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(TollgateConfig::default())
    }
}
