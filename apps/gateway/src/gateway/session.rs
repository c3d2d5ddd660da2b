//! Per-connection lifecycle state, owned by the task serving the transport.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, Active)
                | (Authenticating, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

pub struct Session {
    pub connection_id: String,
    state: ConnectionState,
    last_activity: Instant,
    last_presence_refresh: Instant,
    presence_refresh_interval: Duration,
}

impl Session {
    pub fn new(connection_id: String, presence_refresh_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            state: ConnectionState::Connecting,
            last_activity: now,
            last_presence_refresh: now,
            presence_refresh_interval,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`. Illegal transitions are refused and leave the state as is.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_become(next) {
            tracing::warn!(
                connection_id = %self.connection_id,
                from = ?self.state,
                to = ?next,
                "illegal connection state transition"
            );
            return false;
        }
        self.state = next;
        true
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }

    /// Record inbound traffic. Returns `true` when presence is due for a refresh.
    pub fn record_activity(&mut self) -> bool {
        let now = Instant::now();
        self.last_activity = now;
        if now.duration_since(self.last_presence_refresh) >= self.presence_refresh_interval {
            self.last_presence_refresh = now;
            true
        } else {
            false
        }
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().duration_since(self.last_activity)
    }
}
