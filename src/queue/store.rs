//! Queue Store operations (spec.md §4.2).

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sqlx::Row;
use uuid::Uuid;

use crate::db::models::{CallSource, Campaign, QueueEntry, QueueStatus};
use crate::db::DatabaseManager;
use crate::error::{Error, Result};

pub struct NewQueueEntry {
    pub user_id: Uuid,
    pub agent_id: Uuid,
    pub contact_id: Uuid,
    pub phone: String,
    pub source: CallSource,
    pub campaign_id: Option<Uuid>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct QueueStore {
    db: DatabaseManager,
}

/// Lookahead window for `claim_next`: campaign time-window gating can't be
/// expressed in the `ORDER BY ... LIMIT 1` locked read alone, so we examine
/// a bounded number of the highest-priority eligible rows under lock and
/// take the first that is actually inside its campaign's allowed window.
const CLAIM_LOOKAHEAD: i64 = 20;

impl QueueStore {
    pub fn new(db: DatabaseManager) -> Self {
        Self { db }
    }

    pub async fn enqueue(&self, entry: NewQueueEntry) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let priority = entry.source.queue_priority();
        sqlx::query(
            "INSERT INTO call_queue
                (id, user_id, agent_id, contact_id, phone, source, campaign_id, priority, scheduled_for, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'queued')",
        )
        .bind(id)
        .bind(entry.user_id)
        .bind(entry.agent_id)
        .bind(entry.contact_id)
        .bind(&entry.phone)
        .bind(entry.source)
        .bind(entry.campaign_id)
        .bind(priority)
        .bind(entry.scheduled_for)
        .execute(self.db.pool())
        .await?;
        Ok(id)
    }

    /// Atomically selects and marks `processing` the next eligible entry,
    /// optionally restricted to one user (used by the per-user round-robin
    /// in spec.md §4.3 step 3). Uses `FOR UPDATE SKIP LOCKED` so concurrent
    /// processor workers never contend on the same row.
    pub async fn claim_next(&self, user_id: Option<Uuid>) -> Result<Option<QueueEntry>> {
        let mut tx = self.db.begin().await.map_err(Error::Internal)?;
        let now = Utc::now();

        let rows = if let Some(user_id) = user_id {
            sqlx::query_as::<_, QueueEntry>(
                "SELECT id, user_id, agent_id, contact_id, phone, source, campaign_id,
                        priority, scheduled_for, status, attempts, last_error, created_at
                 FROM call_queue
                 WHERE status = 'queued' AND user_id = $1
                   AND (scheduled_for IS NULL OR scheduled_for <= $2)
                 ORDER BY priority DESC, created_at ASC
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED",
            )
            .bind(user_id)
            .bind(now)
            .bind(CLAIM_LOOKAHEAD)
            .fetch_all(&mut *tx)
            .await?
        } else {
            sqlx::query_as::<_, QueueEntry>(
                "SELECT id, user_id, agent_id, contact_id, phone, source, campaign_id,
                        priority, scheduled_for, status, attempts, last_error, created_at
                 FROM call_queue
                 WHERE status = 'queued'
                   AND (scheduled_for IS NULL OR scheduled_for <= $1)
                 ORDER BY priority DESC, created_at ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED",
            )
            .bind(now)
            .bind(CLAIM_LOOKAHEAD)
            .fetch_all(&mut *tx)
            .await?
        };

        for entry in rows {
            if self.campaign_window_open(&mut tx, entry.campaign_id, now).await? {
                sqlx::query("UPDATE call_queue SET status = 'processing' WHERE id = $1")
                    .bind(entry.id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await.map_err(Error::Database)?;
                return Ok(Some(QueueEntry { status: QueueStatus::Processing, ..entry }));
            }
        }

        tx.rollback().await.map_err(Error::Database)?;
        Ok(None)
    }

    async fn campaign_window_open(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        campaign_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(campaign_id) = campaign_id else {
            return Ok(true);
        };
        let campaign = sqlx::query_as::<_, Campaign>(
            "SELECT id, user_id, timezone, window_start_minute, window_end_minute
             FROM campaigns WHERE id = $1",
        )
        .bind(campaign_id)
        .fetch_optional(&mut **tx)
        .await?;
        let Some(campaign) = campaign else {
            return Ok(true);
        };
        Ok(in_campaign_window(&campaign, now))
    }

    /// Reverts a `processing` entry back to `queued` when a claimed entry
    /// turned out to have no free slot after all (lost the race to another
    /// user on the same tick).
    pub async fn mark_processing_to_queued(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE call_queue SET status = 'queued' WHERE id = $1 AND status = 'processing'")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Terminal statuses are deleted rather than retained — the Call row is
    /// the historical record (spec.md §3: "Terminal-status rows are deleted
    /// ... after a short grace period").
    pub async fn mark_completed(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM call_queue WHERE id = $1").bind(id).execute(self.db.pool()).await?;
        Ok(())
    }

    /// Increments `attempts` and either re-schedules with exponential
    /// backoff or marks `failed` once `max_attempts` is exhausted
    /// (spec.md §4.3 Retry).
    pub async fn retry_or_fail(&self, id: Uuid, reason: &str, max_attempts: i32) -> Result<()> {
        let row = sqlx::query("SELECT attempts FROM call_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        let Some(row) = row else { return Ok(()) };
        let attempts: i32 = row.try_get("attempts")?;
        let next_attempts = attempts + 1;

        if next_attempts >= max_attempts {
            sqlx::query(
                "UPDATE call_queue SET status = 'failed', attempts = $2, last_error = $3 WHERE id = $1",
            )
            .bind(id)
            .bind(next_attempts)
            .bind(reason)
            .execute(self.db.pool())
            .await?;
        } else {
            let backoff_secs = 2i64.pow(next_attempts.max(0) as u32);
            let scheduled_for = Utc::now() + chrono::Duration::seconds(backoff_secs);
            sqlx::query(
                "UPDATE call_queue
                 SET status = 'queued', attempts = $2, last_error = $3, scheduled_for = $4
                 WHERE id = $1",
            )
            .bind(id)
            .bind(next_attempts)
            .bind(reason)
            .bind(scheduled_for)
            .execute(self.db.pool())
            .await?;
        }
        Ok(())
    }

    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        let result =
            sqlx::query("UPDATE call_queue SET status = 'cancelled' WHERE id = $1 AND status = 'queued'")
                .bind(id)
                .execute(self.db.pool())
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// 1-based rank among eligible (queued) entries at the same or higher
    /// priority, ordered as `claim_next` would select them.
    pub async fn position(&self, id: Uuid) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS rank
             FROM call_queue AS higher
             JOIN call_queue AS target ON target.id = $1
             WHERE higher.status = 'queued'
               AND (higher.priority > target.priority
                    OR (higher.priority = target.priority AND higher.created_at <= target.created_at))",
        )
        .bind(id)
        .fetch_one(self.db.pool())
        .await?;
        Ok(row.try_get::<i64, _>("rank")?)
    }
}

fn in_campaign_window(campaign: &Campaign, now: DateTime<Utc>) -> bool {
    let tz: Tz = match campaign.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => return true,
    };
    let local = now.with_timezone(&tz);
    let minute_of_day = local.format("%H").to_string().parse::<i32>().unwrap_or(0) * 60
        + local.format("%M").to_string().parse::<i32>().unwrap_or(0);
    minute_of_day >= campaign.window_start_minute && minute_of_day < campaign.window_end_minute
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn campaign(tz: &str, start: i32, end: i32) -> Campaign {
        Campaign {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            timezone: tz.to_string(),
            window_start_minute: start,
            window_end_minute: end,
        }
    }

    #[test]
    fn gates_outside_the_allowed_local_window() {
        // 05:00 America/Caracas is well before a 09:00-18:00 window.
        let c = campaign("America/Caracas", 9 * 60, 18 * 60);
        let five_am_caracas_utc = "2026-01-15T09:00:00Z".parse().unwrap(); // Caracas is UTC-4
        assert!(!in_campaign_window(&c, five_am_caracas_utc));
    }

    #[test]
    fn admits_inside_the_allowed_local_window() {
        let c = campaign("America/Caracas", 9 * 60, 18 * 60);
        let ten_am_caracas_utc = "2026-01-15T14:00:00Z".parse().unwrap();
        assert!(in_campaign_window(&c, ten_am_caracas_utc));
    }
}
