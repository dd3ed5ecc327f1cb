//! Stale-slot reaper (spec.md §5): defense in depth against a caller that
//! crashed between admitting a call and releasing or attaching its
//! execution id, which would otherwise leak a concurrency slot forever.

use std::time::Duration;

use tracing::{info, warn};

use crate::db::DatabaseManager;
use crate::error::Result;

#[derive(Clone)]
pub struct StaleSlotReaper {
    db: DatabaseManager,
    interval: Duration,
    max_call_age: Duration,
}

impl StaleSlotReaper {
    pub fn new(db: DatabaseManager, interval: Duration, max_call_age: Duration) -> Self {
        Self { db, interval, max_call_age }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            match self.sweep().await {
                Ok(removed) if removed > 0 => info!(removed, "stale-slot reaper removed slots"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "stale-slot reaper sweep failed"),
            }
        }
    }

    /// Removes slots older than `max_call_age` that lack a corresponding
    /// non-terminal Call row.
    pub async fn sweep(&self) -> Result<u64> {
        let max_age_secs = self.max_call_age.as_secs() as i64;
        let result = sqlx::query(
            "DELETE FROM active_calls
             WHERE reserved_at < now() - make_interval(secs => $1)
               AND NOT EXISTS (
                   SELECT 1 FROM calls
                   WHERE calls.id = active_calls.call_id
                     AND calls.status NOT IN ('completed', 'busy', 'no-answer', 'failed')
               )",
        )
        .bind(max_age_secs)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
