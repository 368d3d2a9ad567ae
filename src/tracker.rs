use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::store::UserId;

/// An open timing interval for a user sitting in a tracked channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub joined_at: DateTime<Utc>,
    pub display_name: String,
    /// Minutes already credited to this session by periodic ticks.
    pub credited_minutes: u64,
}

impl Session {
    pub fn new(joined_at: DateTime<Utc>, display_name: impl Into<String>) -> Self {
        Self {
            joined_at,
            display_name: display_name.into(),
            credited_minutes: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct PresenceTracker {
    sessions: HashMap<UserId, Session>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, user: UserId, session: Session) {
        self.sessions.insert(user, session);
    }

    pub fn close(&mut self, user: UserId) -> Option<Session> {
        self.sessions.remove(&user)
    }

    pub fn is_open(&self, user: UserId) -> bool {
        self.sessions.contains_key(&user)
    }

    pub fn get_mut(&mut self, user: UserId) -> Option<&mut Session> {
        self.sessions.get_mut(&user)
    }

    pub fn all_open(&self) -> impl Iterator<Item = (UserId, &Session)> {
        self.sessions.iter().map(|(id, s)| (*id, s))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}
