use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;

use crate::migrations;
use crate::models::{SiteTable, TimerState, UserSettings};

/// Storage key for the [`UserSettings`] record.
pub const KEY_USER_SETTINGS: &str = "user_settings";
/// Storage key for the [`TimerState`] record.
pub const KEY_TIMER_STATE: &str = "timer_state";
/// Storage key for the [`SiteTable`] mapping.
pub const KEY_BLOCKED_SITES: &str = "blocked_sites";

/// Database connection wrapper over the key-value store.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Create a new database connection.
    ///
    /// # Errors
    ///
    /// Returns an error if database directory creation, connection opening,
    /// or schema initialization fails.
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = db_path.unwrap_or_else(Self::default_db_path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(&path).context("Failed to open database connection")?;
        migrations::init_schema(&conn)?;

        log::info!("Database initialized at: {}", path.display());

        Ok(Self { conn })
    }

    /// Get default database path
    fn default_db_path() -> PathBuf {
        let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("fika");
        path.push("fika.db");
        path
    }

    /// Write default `user_settings` and `timer_state` records if absent,
    /// the first-run initialization.
    ///
    /// # Errors
    ///
    /// Returns an error if a read or write fails.
    pub fn ensure_defaults(&self) -> Result<()> {
        if self.get_raw(KEY_USER_SETTINGS)?.is_none() {
            self.put_settings(&UserSettings::default())?;
            log::info!("Wrote default user settings");
        }
        if self.get_raw(KEY_TIMER_STATE)?.is_none() {
            self.put_timer_state(&TimerState::idle())?;
            log::info!("Wrote default timer state");
        }
        Ok(())
    }

    /// Read the settings record, falling back to defaults when the record is
    /// missing or unreadable. Never surfaces a read problem as an error.
    ///
    /// # Errors
    ///
    /// Returns an error only if the underlying query fails.
    pub fn get_settings(&self) -> Result<UserSettings> {
        self.get_json(KEY_USER_SETTINGS)
    }

    /// Replace the settings record wholesale.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn put_settings(&self, settings: &UserSettings) -> Result<()> {
        self.put_json(KEY_USER_SETTINGS, settings)
    }

    /// Read the timer record, falling back to the idle default.
    ///
    /// # Errors
    ///
    /// Returns an error only if the underlying query fails.
    pub fn get_timer_state(&self) -> Result<TimerState> {
        self.get_json(KEY_TIMER_STATE)
    }

    /// Overwrite the timer record.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn put_timer_state(&self, state: &TimerState) -> Result<()> {
        self.put_json(KEY_TIMER_STATE, state)
    }

    /// Read the site usage table, falling back to an empty table.
    ///
    /// # Errors
    ///
    /// Returns an error only if the underlying query fails.
    pub fn get_sites(&self) -> Result<SiteTable> {
        self.get_json(KEY_BLOCKED_SITES)
    }

    /// Overwrite the site usage table.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn put_sites(&self, sites: &SiteTable) -> Result<()> {
        self.put_json(KEY_BLOCKED_SITES, sites)
    }

    fn get_json<T: Default + DeserializeOwned>(&self, key: &str) -> Result<T> {
        match self.get_raw(key)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Ok(value),
                Err(e) => {
                    log::warn!("Unreadable record under '{key}', using defaults: {e}");
                    Ok(T::default())
                }
            },
            None => Ok(T::default()),
        }
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value).with_context(|| format!("serializing '{key}'"))?;
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, raw],
        )?;
        Ok(())
    }

    fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let raw = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(raw)
    }
}
