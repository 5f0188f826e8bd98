pub mod db;
pub mod migrations;
pub mod models;

pub use db::{Database, KEY_BLOCKED_SITES, KEY_TIMER_STATE, KEY_USER_SETTINGS};
pub use models::{
    local_date_string, SessionKind, SiteTable, SiteUsage, TimerState, TimerStatus, UserSettings,
};
