use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// User preferences controlling session durations and the budget reset hour.
///
/// `daily_reset_hour` is stored and editable but the budget reset logic is
/// date-based and does not consult it. Kept in the record so existing stored
/// settings round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub daily_reset_hour: u8,
    #[serde(default = "default_true")]
    pub sound_enabled: bool,
    #[serde(default = "default_focus_minutes")]
    pub focus_duration: u32,
    #[serde(default = "default_short_break_minutes")]
    pub short_break_duration: u32,
    #[serde(default = "default_long_break_minutes")]
    pub long_break_duration: u32,
    #[serde(default)]
    pub auto_start_focus: bool,
}

const fn default_true() -> bool {
    true
}

const fn default_focus_minutes() -> u32 {
    25
}

const fn default_short_break_minutes() -> u32 {
    5
}

const fn default_long_break_minutes() -> u32 {
    15
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            daily_reset_hour: 0,
            sound_enabled: true,
            focus_duration: default_focus_minutes(),
            short_break_duration: default_short_break_minutes(),
            long_break_duration: default_long_break_minutes(),
            auto_start_focus: false,
        }
    }
}

/// The kind of timed session a user can start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Focus,
    ShortBreak,
    LongBreak,
}

impl SessionKind {
    #[must_use]
    pub const fn status(self) -> TimerStatus {
        match self {
            Self::Focus => TimerStatus::Focus,
            Self::ShortBreak => TimerStatus::ShortBreak,
            Self::LongBreak => TimerStatus::LongBreak,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Focus => "focus",
            Self::ShortBreak => "short break",
            Self::LongBreak => "long break",
        }
    }
}

impl std::str::FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "focus" => Ok(Self::Focus),
            "short_break" | "short-break" => Ok(Self::ShortBreak),
            "long_break" | "long-break" => Ok(Self::LongBreak),
            other => Err(format!("unknown session kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    #[default]
    Idle,
    Focus,
    ShortBreak,
    LongBreak,
}

impl TimerStatus {
    /// The session kind this status represents, or `None` when idle.
    #[must_use]
    pub const fn kind(self) -> Option<SessionKind> {
        match self {
            Self::Idle => None,
            Self::Focus => Some(SessionKind::Focus),
            Self::ShortBreak => Some(SessionKind::ShortBreak),
            Self::LongBreak => Some(SessionKind::LongBreak),
        }
    }
}

/// The single persistent timer record.
///
/// Invariant: `status == Idle` exactly when `end_timestamp` is `None`. All
/// writes go through [`TimerState::idle`] / [`TimerState::running`], which
/// cannot produce an illegal pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    #[serde(default)]
    pub status: TimerStatus,
    #[serde(default)]
    pub end_timestamp: Option<DateTime<Utc>>,
    #[serde(default = "default_focus_minutes")]
    pub duration_minutes: u32,
    #[serde(default)]
    pub pomodoros_completed: u32,
}

impl Default for TimerState {
    fn default() -> Self {
        Self::idle()
    }
}

impl TimerState {
    /// The idle default record: no session, default focus length, zero cycles.
    #[must_use]
    pub fn idle() -> Self {
        Self {
            status: TimerStatus::Idle,
            end_timestamp: None,
            duration_minutes: default_focus_minutes(),
            pomodoros_completed: 0,
        }
    }

    #[must_use]
    pub fn running(
        kind: SessionKind,
        end_timestamp: DateTime<Utc>,
        duration_minutes: u32,
        pomodoros_completed: u32,
    ) -> Self {
        Self {
            status: kind.status(),
            end_timestamp: Some(end_timestamp),
            duration_minutes,
            pomodoros_completed,
        }
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        !matches!(self.status, TimerStatus::Idle)
    }

    /// Whether the status/end_timestamp pairing is legal.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        matches!(self.status, TimerStatus::Idle) == self.end_timestamp.is_none()
    }

    /// Seconds until the session ends, clamped to zero. `None` when idle.
    #[must_use]
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.end_timestamp
            .map(|end| end.signed_duration_since(now).num_seconds().max(0))
    }
}

/// Per-domain daily budget record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteUsage {
    pub daily_limit_minutes: u32,
    #[serde(default)]
    pub minutes_used_today: u32,
    pub last_reset_date: String,
    pub created_at: DateTime<Utc>,
}

impl SiteUsage {
    #[must_use]
    pub fn new(daily_limit_minutes: u32, today: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            daily_limit_minutes,
            minutes_used_today: 0,
            last_reset_date: today.to_string(),
            created_at,
        }
    }

    /// Minutes left before the daily limit; negative once the limit is passed.
    #[must_use]
    pub fn remaining_minutes(&self) -> i64 {
        i64::from(self.daily_limit_minutes) - i64::from(self.minutes_used_today)
    }
}

/// The site usage table as stored under the `blocked_sites` key.
pub type SiteTable = HashMap<String, SiteUsage>;

/// Today's calendar date in local time, the identity used for budget resets.
#[must_use]
pub fn local_date_string() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}
