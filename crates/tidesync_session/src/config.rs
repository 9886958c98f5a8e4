//! Configuration for the session manager.

use std::time::Duration;

/// Configuration for session operations.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound for a single sign-in or refresh call.
    pub network_timeout: Duration,
    /// How long before expiry a session reports that it needs a refresh.
    pub refresh_skew: Duration,
}

impl SessionConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            network_timeout: Duration::from_secs(15),
            refresh_skew: Duration::from_secs(60),
        }
    }

    /// Sets the network timeout.
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    /// Sets the refresh skew.
    pub fn with_refresh_skew(mut self, skew: Duration) -> Self {
        self.refresh_skew = skew;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_builder() {
        let config = SessionConfig::new()
            .with_network_timeout(Duration::from_secs(3))
            .with_refresh_skew(Duration::from_secs(5));

        assert_eq!(config.network_timeout, Duration::from_secs(3));
        assert_eq!(config.refresh_skew, Duration::from_secs(5));
    }
}
