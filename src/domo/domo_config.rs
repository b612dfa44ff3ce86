//! Timing configuration shared by broker, client and worker. Both ends of a
//!  deployment must agree on these values, the protocol does not negotiate
//!  them.

use std::time::Duration;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2500);
pub const DEFAULT_HEARTBEAT_LIVENESS: u32 = 3;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2500);

#[derive(Debug, Clone)]
pub struct DomoConfig {
    /// cadence at which idle peers confirm they are alive
    pub heartbeat_interval: Duration,
    /// missed heartbeats before a peer counts as gone
    pub heartbeat_liveness: u32,
    /// pause before a worker reconnects to a silent broker
    pub reconnect_delay: Duration,
}

impl DomoConfig {
    pub fn new() -> DomoConfig {
        DomoConfig {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_liveness: DEFAULT_HEARTBEAT_LIVENESS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// The silence window after which a peer is presumed dead.
    pub fn heartbeat_expiry(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_liveness
    }
}

impl Default for DomoConfig {
    fn default() -> Self {
        DomoConfig::new()
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_expiry_window() {
        assert_eq!(DomoConfig::new().heartbeat_expiry(), Duration::from_millis(7500));
    }
}
