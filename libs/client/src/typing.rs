//! Client-local typing indicators.
//!
//! A `comment:typing` start is shown for [`TYPING_EXPIRY`] unless a stop for
//! the same user and room arrives first, so a lost stop event never leaves an
//! indicator stuck on screen.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;

pub const TYPING_EXPIRY: Duration = Duration::from_secs(3);

/// Payload of the `comment:typing` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub user_id: String,
    pub username: String,
    pub is_typing: bool,
    pub room: String,
}

#[derive(Debug)]
pub struct TypingTracker {
    expiry: Duration,
    /// (room, user id) -> (display name, expires at)
    active: HashMap<(String, String), (String, Instant)>,
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new(TYPING_EXPIRY)
    }
}

impl TypingTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            active: HashMap::new(),
        }
    }

    pub fn apply(&mut self, event: &TypingEvent, now: Instant) {
        let key = (event.room.clone(), event.user_id.clone());
        if event.is_typing {
            self.active
                .insert(key, (event.username.clone(), now + self.expiry));
        } else {
            self.active.remove(&key);
        }
    }

    /// Display names of users typing in `room` at `now`, sorted.
    pub fn typing_in(&self, room: &str, now: Instant) -> Vec<String> {
        let mut names: Vec<String> = self
            .active
            .iter()
            .filter(|((r, _), (_, expires))| r == room && *expires > now)
            .map(|(_, (name, _))| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Forget expired indicators. Returns how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.active.len();
        self.active.retain(|_, (_, expires)| *expires > now);
        before - self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
