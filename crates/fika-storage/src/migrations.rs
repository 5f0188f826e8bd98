use anyhow::Result;
use rusqlite::Connection;

/// Initialize the key-value schema.
///
/// All three records (`user_settings`, `timer_state`, `blocked_sites`) live
/// in one table as JSON values keyed by string, matching the shape external
/// collaborators read them in.
///
/// # Errors
///
/// Returns an error if table creation fails.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}
