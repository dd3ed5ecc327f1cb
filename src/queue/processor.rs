//! Background queue drain loop (spec.md §4.3).
//!
//! Ticks on a fixed interval, round-robins over users with queued work so
//! one user's backlog cannot starve another, and stops admitting for the
//! tick as soon as the system-wide slot count is exhausted.

use std::time::Duration;

use sqlx::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmitOutcome, ReserveRequest};
use crate::db::DatabaseManager;
use crate::error::Result;
use crate::provider::VoiceProviderAdapter;
use crate::queue::store::QueueStore;

#[derive(Clone)]
pub struct QueueProcessor {
    db: DatabaseManager,
    queue: QueueStore,
    admission: AdmissionController,
    provider: std::sync::Arc<dyn VoiceProviderAdapter>,
    tick_interval: Duration,
    max_attempts: i32,
}

impl QueueProcessor {
    pub fn new(
        db: DatabaseManager,
        admission: AdmissionController,
        provider: std::sync::Arc<dyn VoiceProviderAdapter>,
        tick_interval: Duration,
        max_attempts: i32,
    ) -> Self {
        Self { queue: QueueStore::new(db.clone()), db, admission, provider, tick_interval, max_attempts }
    }

    /// Runs until the process exits; intended to be spawned as a background
    /// tokio task from `server.rs`.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                warn!(error = %e, "queue processor tick failed");
            }
        }
    }

    pub async fn tick(&self) -> Result<()> {
        let mut global_slots = self.admission.active_slot_count().await?;
        if global_slots >= self.admission.system_limit() {
            debug!("system at capacity, skipping queue drain this tick");
            return Ok(());
        }

        for user_id in self.users_with_queued_work().await? {
            if global_slots >= self.admission.system_limit() {
                break;
            }
            if let Some(admitted) = self.drain_one_for_user(user_id).await? {
                if admitted {
                    global_slots += 1;
                }
            }
        }
        Ok(())
    }

    /// Claims and attempts to admit a single queued entry for `user_id`.
    /// Returns `Some(true)` if a slot was consumed, `Some(false)` if the
    /// entry was re-examined but no slot was free, `None` if nothing was
    /// queued for this user.
    async fn drain_one_for_user(&self, user_id: Uuid) -> Result<Option<bool>> {
        let Some(entry) = self.queue.claim_next(Some(user_id)).await? else {
            return Ok(None);
        };

        let call_id = Uuid::new_v4();
        let req = ReserveRequest {
            user_id: entry.user_id,
            agent_id: entry.agent_id,
            contact_id: entry.contact_id,
            phone: entry.phone.clone(),
            source: entry.source,
            campaign_id: entry.campaign_id,
        };

        match self.admission.try_admit_claimed(call_id, &req).await {
            Ok(AdmitOutcome::StillFull) => {
                self.queue.mark_processing_to_queued(entry.id).await?;
                Ok(Some(false))
            }
            Ok(AdmitOutcome::Admitted) => {
                match self.dispatch(call_id, &entry).await {
                    Ok(()) => {
                        self.queue.mark_completed(entry.id).await?;
                    }
                    Err(e) => {
                        self.queue
                            .retry_or_fail(entry.id, &e.to_string(), self.max_attempts)
                            .await?;
                    }
                }
                Ok(Some(true))
            }
            Err(e) => {
                warn!(error = %e, queue_entry_id = %entry.id, "admission failed for queued entry");
                self.queue.retry_or_fail(entry.id, &e.to_string(), self.max_attempts).await?;
                Ok(Some(false))
            }
        }
    }

    /// Dispatches a just-admitted slot to the voice provider. A failed
    /// dispatch (provider 5xx/timeout) releases the slot and propagates the
    /// error so the caller can route it through the attempt-capped retry in
    /// `QueueStore::retry_or_fail` rather than treating it as delivered.
    async fn dispatch(&self, call_id: Uuid, entry: &crate::db::models::QueueEntry) -> Result<()> {
        match self.provider.start_call(call_id, &entry.phone, entry.agent_id).await {
            Ok(execution_id) => {
                self.admission.attach_execution_id(call_id, &execution_id).await?;
                info!(%call_id, execution_id, "dispatched call to voice provider");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, %call_id, "voice provider dispatch failed, releasing slot");
                if let Err(release_err) = self.admission.release_by_internal_id(call_id).await {
                    warn!(error = %release_err, %call_id, "failed to release slot after dispatch failure");
                }
                Err(e)
            }
        }
    }

    async fn users_with_queued_work(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT DISTINCT user_id FROM call_queue WHERE status = 'queued'
             ORDER BY user_id",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.into_iter().map(|r| r.get("user_id")).collect())
    }
}
