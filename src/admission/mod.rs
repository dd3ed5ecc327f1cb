//! Concurrency admission and slot reservation (spec.md §4.1).
//!
//! The decision-plus-insert is linearizable per spec.md §9: we run it inside
//! a `SERIALIZABLE` transaction and retry on serialization conflict, rather
//! than hand-rolling per-row locking — Postgres already gives us the
//! consistent-snapshot guarantee the spec asks for.

use chrono::Utc;
use sqlx::{Postgres, Transaction};
use tokio::time::sleep;
use uuid::Uuid;

use crate::db::models::{CallSource, CallStatus, SlotKind};
use crate::db::DatabaseManager;
use crate::error::{Error, Result};
use crate::hash::hash_identifier;
use crate::queue::store::{NewQueueEntry, QueueStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionResult {
    Admitted { call_id: Uuid },
    Queued { queue_entry_id: Uuid, position: i64, estimated_wait_seconds: i64 },
}

/// Outcome of a bare slot-reservation attempt, without the queue fallback
/// `reserve` adds on top (used by the queue processor, which is already
/// working a queued entry and just wants to know whether a slot freed up).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Admitted,
    StillFull,
}

pub struct ReserveRequest {
    pub user_id: Uuid,
    pub agent_id: Uuid,
    pub contact_id: Uuid,
    pub phone: String,
    pub source: CallSource,
    pub campaign_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct AdmissionController {
    db: DatabaseManager,
    queue: QueueStore,
    system_limit: i64,
    default_user_limit: i32,
}

/// Rough wait-time estimate: position in queue times an assumed average
/// call length. Not specified exactly by spec.md — an Open Question
/// resolution recorded in DESIGN.md.
const ASSUMED_AVG_CALL_SECONDS: i64 = 90;

const SERIALIZATION_RETRY_BACKOFFS_MS: [u64; 3] = [100, 200, 400];

impl AdmissionController {
    pub fn new(db: DatabaseManager, system_limit: i64, default_user_limit: i32) -> Self {
        Self { queue: QueueStore::new(db.clone()), db, system_limit, default_user_limit }
    }

    /// The caller generates `call_id` up front so the eventual Call row and
    /// SlotEntry row share an id (spec.md §4.1).
    pub async fn reserve(&self, call_id: Uuid, req: ReserveRequest) -> Result<AdmissionResult> {
        match self.try_admit_with_retry(call_id, &req).await? {
            AdmitOutcome::Admitted => Ok(AdmissionResult::Admitted { call_id }),
            AdmitOutcome::StillFull => {
                let queue_entry_id = self
                    .queue
                    .enqueue(NewQueueEntry {
                        user_id: req.user_id,
                        agent_id: req.agent_id,
                        contact_id: req.contact_id,
                        phone: req.phone.clone(),
                        source: req.source,
                        campaign_id: req.campaign_id,
                        scheduled_for: None,
                    })
                    .await?;
                let position = self.queue.position(queue_entry_id).await?;
                Ok(AdmissionResult::Queued {
                    queue_entry_id,
                    position,
                    estimated_wait_seconds: position * ASSUMED_AVG_CALL_SECONDS,
                })
            }
        }
    }

    /// Used by the queue processor: attempts to seat an already-queued
    /// entry without re-enqueuing it if no slot is free (the caller keeps
    /// the entry `queued` and tries again next tick).
    pub async fn try_admit_claimed(&self, call_id: Uuid, req: &ReserveRequest) -> Result<AdmitOutcome> {
        self.try_admit_with_retry(call_id, req).await
    }

    async fn try_admit_with_retry(&self, call_id: Uuid, req: &ReserveRequest) -> Result<AdmitOutcome> {
        for (attempt, backoff_ms) in SERIALIZATION_RETRY_BACKOFFS_MS.iter().enumerate() {
            match self.try_reserve(call_id, req).await {
                Ok(result) => return Ok(result),
                Err(Error::Database(sqlx::Error::Database(db_err)))
                    if is_serialization_failure(db_err.as_ref()) && attempt + 1 < SERIALIZATION_RETRY_BACKOFFS_MS.len() =>
                {
                    sleep(std::time::Duration::from_millis(*backoff_ms)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        self.try_reserve(call_id, req).await
    }

    async fn try_reserve(&self, call_id: Uuid, req: &ReserveRequest) -> Result<AdmitOutcome> {
        let mut tx = self.db.begin().await.map_err(Error::Internal)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE").execute(&mut *tx).await?;

        let user_row = sqlx::query_as::<_, (i64, i32)>(
            "SELECT credit_balance, concurrent_call_limit FROM users WHERE id = $1",
        )
        .bind(req.user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((credit_balance, mut user_limit)) = user_row else {
            tx.rollback().await.ok();
            return Err(Error::UnknownUser(hash_identifier(&req.user_id.to_string())));
        };
        if user_limit <= 0 {
            user_limit = self.default_user_limit;
        }
        if user_limit <= 0 {
            tx.rollback().await.ok();
            return Err(Error::NonPositiveLimit(hash_identifier(&req.user_id.to_string())));
        }
        if matches!(req.source, CallSource::Direct) && credit_balance <= 0 {
            tx.rollback().await.ok();
            return Err(Error::InsufficientCredits {
                user: hash_identifier(&req.user_id.to_string()),
                balance: credit_balance,
            });
        }

        let global_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM active_calls").fetch_one(&mut *tx).await?;
        let user_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM active_calls WHERE user_id = $1")
                .bind(req.user_id)
                .fetch_one(&mut *tx)
                .await?;

        if global_count >= self.system_limit || user_count >= i64::from(user_limit) {
            tx.commit().await.map_err(Error::Database)?;
            return Ok(AdmitOutcome::StillFull);
        }

        let kind = match req.source {
            CallSource::Direct => SlotKind::Direct,
            CallSource::Campaign => SlotKind::Campaign,
            CallSource::Inbound => SlotKind::Inbound,
        };
        sqlx::query(
            "INSERT INTO active_calls (call_id, user_id, kind, reserved_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(call_id)
        .bind(req.user_id)
        .bind(kind)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO calls (id, user_id, agent_id, contact_id, phone, source, status, campaign_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(call_id)
        .bind(req.user_id)
        .bind(req.agent_id)
        .bind(req.contact_id)
        .bind(&req.phone)
        .bind(req.source)
        .bind(CallStatus::Initiated)
        .bind(req.campaign_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(AdmitOutcome::Admitted)
    }

    /// Called after the Voice Provider Adapter returns an execution id, so
    /// later webhooks (which only know the execution id) can find the slot.
    pub async fn attach_execution_id(&self, call_id: Uuid, execution_id: &str) -> Result<()> {
        sqlx::query("UPDATE active_calls SET execution_id = $2 WHERE call_id = $1")
            .bind(call_id)
            .bind(execution_id)
            .execute(self.db.pool())
            .await?;
        sqlx::query("UPDATE calls SET execution_id = $2 WHERE id = $1")
            .bind(call_id)
            .bind(execution_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Idempotent: no error if the slot is already gone.
    pub async fn release_by_internal_id(&self, call_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM active_calls WHERE call_id = $1")
            .bind(call_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Idempotent: no error if the slot is already gone.
    pub async fn release_by_execution_id(&self, execution_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM active_calls WHERE execution_id = $1")
            .bind(execution_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Same as [`Self::release_by_execution_id`], but runs inside a
    /// transaction the caller already holds open, so the release commits
    /// atomically with whatever else that transaction does.
    pub async fn release_by_execution_id_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        execution_id: &str,
    ) -> Result<()> {
        sqlx::query("DELETE FROM active_calls WHERE execution_id = $1")
            .bind(execution_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn active_slot_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM active_calls").fetch_one(self.db.pool()).await?)
    }

    pub async fn active_slot_count_for_user(&self, user_id: Uuid) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM active_calls WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(self.db.pool())
            .await?)
    }

    pub fn system_limit(&self) -> i64 {
        self.system_limit
    }
}

fn is_serialization_failure(db_err: &(dyn sqlx::error::DatabaseError + 'static)) -> bool {
    // Postgres SQLSTATE 40001 = serialization_failure.
    db_err.code().as_deref() == Some("40001")
}
