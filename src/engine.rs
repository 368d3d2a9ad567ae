//! Voice-presence accounting.
//!
//! Every entry point takes `now` explicitly and runs to completion without
//! awaiting, so callers can hold the engine lock for one whole mutation and
//! push the returned [`MirrorRow`]s after releasing it.
//!
//! Per user there are two states: out of scope (no session) and tracking
//! (open session). Denylisted channels are out of scope, but moving into one
//! from a tracked session costs [`PENALTY_MINUTES`].

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use crate::buckets::BucketKeys;
use crate::mirror::MirrorRow;
use crate::store::{ActivityStore, UserId};
use crate::tracker::{PresenceTracker, Session};

pub type ChannelId = u64;

pub const PENALTY_MINUTES: u64 = 30;
const MINUTE_MS: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Joined a tracked channel; session opened.
    Opened,
    /// Left voice; `credited` of the session's `minutes` were newly added.
    Credited { minutes: u64, credited: u64 },
    /// Left voice before a full minute had passed.
    TooShort,
    /// Moved into a denylisted channel with enough lifetime to pay for it.
    Penalized { minutes: u64, delta: i64 },
    /// Moved into a denylisted channel without 30 recorded minutes.
    PenaltySkipped { minutes: u64 },
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct EventOutcome {
    pub transition: Transition,
    pub mirror: Option<MirrorRow>,
}

#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    pub elapsed_minutes: u64,
    pub delayed: bool,
    pub mirror: Vec<MirrorRow>,
}

/// A member seen in voice when the bot starts.
#[derive(Debug, Clone)]
pub struct PresentMember {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivitySummary {
    pub lifetime_minutes: u64,
    pub weekly_minutes: u64,
    pub monthly_minutes: u64,
    pub in_session: bool,
}

pub struct AccountingEngine {
    store: ActivityStore,
    tracker: PresenceTracker,
    denylist: HashSet<ChannelId>,
    last_tick: DateTime<Utc>,
}

impl AccountingEngine {
    pub fn new(store: ActivityStore, denylist: HashSet<ChannelId>, now: DateTime<Utc>) -> Self {
        Self {
            store,
            tracker: PresenceTracker::new(),
            denylist,
            last_tick: now,
        }
    }

    pub fn is_denylisted(&self, channel: ChannelId) -> bool {
        self.denylist.contains(&channel)
    }

    pub fn is_tracking(&self, user: UserId) -> bool {
        self.tracker.is_open(user)
    }

    pub fn open_sessions(&self) -> usize {
        self.tracker.len()
    }

    /// Applies one voice-state change. `channel` is where the user is now.
    pub fn on_voice_update(
        &mut self,
        user: UserId,
        display_name: &str,
        channel: Option<ChannelId>,
        now: DateTime<Utc>,
    ) -> EventOutcome {
        let tracking = self.tracker.is_open(user);
        self.store.get_or_create(user);

        if let Some(session) = self.tracker.get_mut(user) {
            session.display_name = display_name.to_string();
        }

        match channel {
            Some(ch) if tracking && self.is_denylisted(ch) => {
                self.move_to_denylisted(user, display_name, now)
            }
            Some(ch) if !tracking && !self.is_denylisted(ch) => {
                self.tracker.open(user, Session::new(now, display_name));
                debug!("{} joined voice channel {}", display_name, ch);
                unchanged(Transition::Opened)
            }
            None if tracking => self.leave(user, display_name, now),
            _ => unchanged(Transition::Unchanged),
        }
    }

    fn leave(&mut self, user: UserId, display_name: &str, now: DateTime<Utc>) -> EventOutcome {
        let Some(session) = self.tracker.close(user) else {
            return unchanged(Transition::Unchanged);
        };
        let minutes = session_minutes(session.joined_at, now);
        if minutes < 1 {
            debug!("Ignored {} (less than 1 minute)", display_name);
            return unchanged(Transition::TooShort);
        }

        let credited = minutes.saturating_sub(session.credited_minutes);
        info!(
            "{} left voice after {}m ({}m new)",
            display_name, minutes, credited
        );
        let transition = Transition::Credited { minutes, credited };
        if credited == 0 {
            return unchanged(transition);
        }

        let keys = BucketKeys::at(now);
        self.store.get_or_create(user).credit(credited, &keys);
        self.persist();
        EventOutcome {
            transition,
            mirror: Some(self.row(user, display_name, &keys)),
        }
    }

    fn move_to_denylisted(
        &mut self,
        user: UserId,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> EventOutcome {
        let Some(session) = self.tracker.close(user) else {
            return unchanged(Transition::Unchanged);
        };
        let minutes = session_minutes(session.joined_at, now);

        if self.store.get_or_create(user).lifetime_minutes < PENALTY_MINUTES {
            info!(
                "Skipped penalty for {} (not enough time on record)",
                display_name
            );
            return unchanged(Transition::PenaltySkipped { minutes });
        }

        let delta = minutes as i64 - session.credited_minutes as i64 - PENALTY_MINUTES as i64;
        let keys = BucketKeys::at(now);
        self.store.get_or_create(user).adjust(delta, &keys);
        self.persist();
        info!(
            "Applied {}m penalty to {} after move to denylisted channel ({:+}m)",
            PENALTY_MINUTES, display_name, delta
        );
        EventOutcome {
            transition: Transition::Penalized { minutes, delta },
            mirror: Some(self.row(user, display_name, &keys)),
        }
    }

    /// Credits the whole minutes elapsed since the last credited tick to every
    /// open session, once.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let elapsed_ms = (now - self.last_tick).num_milliseconds();
        let elapsed = if elapsed_ms > 0 {
            (elapsed_ms / MINUTE_MS) as u64
        } else {
            0
        };
        if elapsed < 1 {
            return TickOutcome::default();
        }

        let delayed = elapsed > 1;
        if delayed {
            warn!("Tick delayed, {} minutes passed since last tick", elapsed);
        }
        // carry the sub-minute remainder into the next tick
        self.last_tick += Duration::minutes(elapsed as i64);

        let keys = BucketKeys::at(now);
        let credited: Vec<(UserId, String)> = self
            .tracker
            .all_open()
            .map(|(user, session)| (user, session.display_name.clone()))
            .collect();
        if credited.is_empty() {
            return TickOutcome {
                elapsed_minutes: elapsed,
                delayed,
                mirror: Vec::new(),
            };
        }

        for (user, _) in &credited {
            if let Some(session) = self.tracker.get_mut(*user) {
                session.credited_minutes += elapsed;
            }
            self.store.get_or_create(*user).credit(elapsed, &keys);
        }
        self.persist();
        debug!("Credited {}m to {} open sessions", elapsed, credited.len());

        let mirror = credited
            .iter()
            .map(|(user, name)| self.row(*user, name, &keys))
            .collect();
        TickOutcome {
            elapsed_minutes: elapsed,
            delayed,
            mirror,
        }
    }

    /// Opens sessions for everyone already sitting in a tracked channel.
    /// Time before `now` is never credited.
    pub fn reconcile(
        &mut self,
        present: impl IntoIterator<Item = PresentMember>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut opened = 0;
        for member in present {
            if self.is_denylisted(member.channel_id) || self.tracker.is_open(member.user_id) {
                continue;
            }
            info!(
                "Tracking active voice user on startup: {} in {}",
                member.display_name, member.channel_id
            );
            self.tracker
                .open(member.user_id, Session::new(now, member.display_name));
            opened += 1;
        }
        self.last_tick = now;
        opened
    }

    pub fn summary(&self, user: UserId, now: DateTime<Utc>) -> ActivitySummary {
        let keys = BucketKeys::at(now);
        let record = self.store.get(user);
        ActivitySummary {
            lifetime_minutes: record.map_or(0, |r| r.lifetime_minutes),
            weekly_minutes: record.map_or(0, |r| r.week(&keys.week)),
            monthly_minutes: record.map_or(0, |r| r.month(&keys.month)),
            in_session: self.is_tracking(user),
        }
    }

    fn row(&self, user: UserId, display_name: &str, keys: &BucketKeys) -> MirrorRow {
        let record = self.store.get(user);
        MirrorRow {
            user_id: user,
            display_name: display_name.to_string(),
            lifetime_minutes: record.map_or(0, |r| r.lifetime_minutes),
            weekly_minutes: record.map_or(0, |r| r.week(&keys.week)),
            monthly_minutes: record.map_or(0, |r| r.month(&keys.month)),
        }
    }

    fn persist(&self) {
        if let Err(e) = self.store.save() {
            error!("Failed to save activity data: {}", e);
        }
    }
}

fn unchanged(transition: Transition) -> EventOutcome {
    EventOutcome {
        transition,
        mirror: None,
    }
}

/// Session length rounded to the nearest minute.
fn session_minutes(joined_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let ms = (now - joined_at).num_milliseconds().max(0);
    ((ms + MINUTE_MS / 2) / MINUTE_MS) as u64
}
