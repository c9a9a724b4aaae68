//! Persisted mutual exclusion over a shared SQLite `scheduler_locks` table.
//!
//! Every primitive is a single SQL statement, so two processes racing on the
//! same resource are serialised by SQLite itself. Acquisition in particular is
//! one conditional upsert guarded by the expiry predicate; there is never a
//! read followed by a separate write.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    clock::{Clock, SystemClock},
    db::init_db,
    error::Result,
    types::Lease,
};

pub struct LockManager {
    conn: Arc<Mutex<Connection>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    /// Wrap a connection, initialising the lease schema if needed.
    pub fn new(conn: Connection, ttl: Duration) -> Result<Self> {
        Self::with_clock(conn, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(conn: Connection, ttl: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl,
            clock,
            reaper: Mutex::new(None),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn ttl_ms(&self) -> i64 {
        i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX)
    }

    /// Heartbeats strictly older than this are expired.
    fn expiry_cutoff(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.ttl_ms())
    }

    /// Claim `name` for `holder_id`.
    ///
    /// Succeeds when no row exists or the existing row is expired. A live
    /// lease blocks every acquirer, including its own holder, so two
    /// instances configured with the same holder id still exclude each other.
    #[instrument(skip(self))]
    pub fn acquire_lock(&self, name: &str, holder_id: &str) -> Result<bool> {
        let now = self.now_ms();
        let cutoff = self.expiry_cutoff(now);
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT INTO scheduler_locks (resource_name, holder_id, acquired_at, last_heartbeat)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(resource_name) DO UPDATE SET
                 holder_id      = excluded.holder_id,
                 acquired_at    = excluded.acquired_at,
                 last_heartbeat = excluded.last_heartbeat
             WHERE scheduler_locks.last_heartbeat < ?4",
            params![name, holder_id, now, cutoff],
        )?;
        let acquired = changed == 1;
        debug!(acquired, "acquire attempt");
        Ok(acquired)
    }

    /// Refresh the heartbeat of a live lease held by `holder_id`.
    ///
    /// `false` means the lease is gone, expired, or owned by another holder;
    /// callers must treat that as lock loss.
    #[instrument(skip(self))]
    pub fn update_heartbeat(&self, name: &str, holder_id: &str) -> Result<bool> {
        let now = self.now_ms();
        let cutoff = self.expiry_cutoff(now);
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE scheduler_locks SET last_heartbeat = ?3
             WHERE resource_name = ?1 AND holder_id = ?2 AND last_heartbeat >= ?4",
            params![name, holder_id, now, cutoff],
        )?;
        Ok(changed == 1)
    }

    /// Drop the lease iff `holder_id` owns it. Idempotent; returns whether a
    /// row was removed.
    #[instrument(skip(self))]
    pub fn release_lock(&self, name: &str, holder_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "DELETE FROM scheduler_locks WHERE resource_name = ?1 AND holder_id = ?2",
            params![name, holder_id],
        )?;
        Ok(changed == 1)
    }

    /// Drop every lease owned by `holder_id`. Used on shutdown.
    #[instrument(skip(self))]
    pub fn release_all_for_holder(&self, holder_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM scheduler_locks WHERE holder_id = ?1",
            params![holder_id],
        )?;
        if n > 0 {
            info!(count = n, "released leases held by this process");
        }
        Ok(n)
    }

    pub fn get_lock(&self, name: &str) -> Result<Option<Lease>> {
        let ttl = self.ttl;
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT resource_name, holder_id, acquired_at, last_heartbeat
             FROM scheduler_locks WHERE resource_name = ?1",
            params![name],
            |row| row_to_lease(row, ttl),
        ) {
            Ok(lease) => Ok(Some(lease)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshot of every lease row, expired or not.
    pub fn get_all_locks(&self) -> Result<Vec<Lease>> {
        let ttl = self.ttl;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT resource_name, holder_id, acquired_at, last_heartbeat
             FROM scheduler_locks ORDER BY resource_name",
        )?;
        let leases = stmt
            .query_map([], |row| row_to_lease(row, ttl))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(leases)
    }

    /// Administrative escape hatch: clear every lease regardless of holder.
    #[instrument(skip(self))]
    pub fn force_release_all_locks(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM scheduler_locks", [])?;
        warn!(count = n, "force-released all leases");
        Ok(n)
    }

    /// One reaper sweep: delete rows whose heartbeat is older than the TTL.
    ///
    /// Safe to run concurrently with acquirers and with other reapers; a row
    /// already reclaimed or deleted simply doesn't match.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let cutoff = self.expiry_cutoff(self.now_ms());
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM scheduler_locks WHERE last_heartbeat < ?1",
            params![cutoff],
        )?;
        if n > 0 {
            warn!(count = n, "reaped expired leases");
        }
        Ok(n)
    }

    /// Spawn the background reaper. A second call while one is running is a no-op.
    pub fn start_cleanup_process(self: &Arc<Self>, every: Duration) {
        let mut slot = self.reaper.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() fires immediately; the first sweep waits a full period.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = manager.cleanup_expired() {
                    error!("lease reaper sweep failed: {e}");
                }
            }
        }));
        info!(interval_secs = every.as_secs(), "lease reaper started");
    }

    pub fn stop_cleanup_process(&self) {
        if let Some(handle) = self.reaper.lock().unwrap().take() {
            handle.abort();
            info!("lease reaper stopped");
        }
    }

    pub fn is_cleanup_running(&self) -> bool {
        self.reaper.lock().unwrap().is_some()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.reaper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

fn row_to_lease(row: &rusqlite::Row<'_>, ttl: Duration) -> rusqlite::Result<Lease> {
    let acquired_ms: i64 = row.get(2)?;
    let heartbeat_ms: i64 = row.get(3)?;
    let last_heartbeat_at = from_millis(heartbeat_ms);
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    Ok(Lease {
        resource_name: row.get(0)?,
        holder_id: row.get(1)?,
        acquired_at: from_millis(acquired_ms),
        last_heartbeat_at,
        expires_at: last_heartbeat_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
