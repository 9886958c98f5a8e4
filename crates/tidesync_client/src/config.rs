//! Client configuration.

use tidesync_engine::EngineConfig;
use tidesync_session::SessionConfig;

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Session manager settings.
    pub session: SessionConfig,
    /// Sync engine settings.
    pub engine: EngineConfig,
}

impl ClientConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the session manager settings.
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Sets the sync engine settings.
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }
}
