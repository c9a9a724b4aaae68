use rusqlite::Connection;

use crate::error::Result;

/// Initialise the lease schema in `conn`.
///
/// Creates the `scheduler_locks` table (idempotent) and an index on
/// `last_heartbeat` so the reaper's expiry sweep stays cheap. Timestamps are
/// Unix milliseconds so expiry is a plain integer comparison.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduler_locks (
            resource_name   TEXT    NOT NULL PRIMARY KEY,
            holder_id       TEXT    NOT NULL,
            acquired_at     INTEGER NOT NULL,   -- unix ms
            last_heartbeat  INTEGER NOT NULL    -- unix ms
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_scheduler_locks_heartbeat
            ON scheduler_locks (last_heartbeat);
        ",
    )?;
    Ok(())
}
