//! Webhook-driven call lifecycle state machine (spec.md §4.6).
//!
//! Every handler here is idempotent: replays of the same webhook must
//! produce the same terminal state and at most one side effect of each
//! kind. That's enforced with conditional updates keyed on null-checks
//! rather than by deduping at the ingress.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{error, warn};
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::db::models::{Call, CallSource, CallStatus};
use crate::db::DatabaseManager;
use crate::error::{Error, Result};
use crate::ledger::{credits_for_duration, CreditLedger};
use crate::queue::store::{NewQueueEntry, QueueStore};

#[derive(Debug, Clone, Deserialize)]
pub struct TelephonyData {
    pub duration_seconds: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(alias = "id")]
    pub execution_id: String,
    pub status: String,
    pub transcript: Option<String>,
    pub recording_url: Option<String>,
    pub telephony_data: Option<TelephonyData>,
    pub hangup_by: Option<String>,
    pub hangup_reason: Option<String>,
    pub hangup_provider_code: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Present only on inbound calls the control plane has never seen
    /// before — lets the `initiated` handler create the Call/Contact/slot
    /// rows from scratch.
    pub agent_id: Option<Uuid>,
    pub phone: Option<String>,
}

#[derive(Clone)]
pub struct LifecycleEngine {
    db: DatabaseManager,
    admission: AdmissionController,
    ledger: CreditLedger,
    queue: QueueStore,
}

/// Fixed backoff for a fresh campaign-call retry attempt after busy/no-answer.
/// This is a distinct concern from the queue-dispatch retry in §4.3, which
/// already has an attempt-count-capped exponential schedule; no equivalent
/// cap is specified for this path, so one retry with a flat delay is used.
const CAMPAIGN_RETRY_BACKOFF_SECONDS: i64 = 300;

impl LifecycleEngine {
    pub fn new(
        db: DatabaseManager,
        admission: AdmissionController,
        ledger: CreditLedger,
    ) -> Self {
        Self { queue: QueueStore::new(db.clone()), db, admission, ledger }
    }

    /// Entry point for the webhook handler. Never returns an error that the
    /// HTTP layer should act on — failures are logged and swallowed so the
    /// ingress can still answer 200 (spec.md §4.5).
    pub async fn handle(&self, payload: WebhookPayload) {
        if let Err(e) = self.dispatch(&payload).await {
            error!(error = %e, execution_id = %payload.execution_id, "lifecycle handler failed");
        }
    }

    async fn dispatch(&self, payload: &WebhookPayload) -> Result<()> {
        match payload.status.as_str() {
            "initiated" => self.handle_initiated(payload).await,
            "ringing" => self.handle_ringing(payload).await,
            "in-progress" => self.handle_in_progress(payload).await,
            "call-disconnected" => self.handle_call_disconnected(payload).await,
            "completed" => self.handle_completed(payload).await,
            "busy" => self.handle_terminal_failure(payload, CallStatus::Busy).await,
            "no-answer" => self.handle_terminal_failure(payload, CallStatus::NoAnswer).await,
            other => {
                warn!(status = other, "unrecognized webhook status, ignoring");
                Ok(())
            }
        }
    }

    async fn find_by_execution_id(&self, execution_id: &str) -> Result<Option<Call>> {
        Ok(sqlx::query_as::<_, Call>(
            "SELECT id, user_id, agent_id, contact_id, phone, execution_id, source, status,
                    ringing_started_at, call_answered_at, call_disconnected_at,
                    hangup_by, hangup_reason, hangup_provider_code, transcript, recording_url,
                    duration_seconds, credits_consumed, campaign_id, created_at
             FROM calls WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_optional(self.db.pool())
        .await?)
    }

    async fn handle_initiated(&self, payload: &WebhookPayload) -> Result<()> {
        if self.find_by_execution_id(&payload.execution_id).await?.is_some() {
            // Already upserted by the direct/campaign admission path; this
            // status carries no further fields to apply.
            return Ok(());
        }
        self.create_inbound_call(payload).await
    }

    async fn create_inbound_call(&self, payload: &WebhookPayload) -> Result<()> {
        let (Some(agent_id), Some(phone)) = (payload.agent_id, payload.phone.as_deref()) else {
            warn!(
                execution_id = %payload.execution_id,
                "initiated webhook for unknown call carries no agent_id/phone, cannot create inbound call"
            );
            return Ok(());
        };

        let user_id: Uuid = sqlx::query_scalar("SELECT user_id FROM agents WHERE id = $1")
            .bind(agent_id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| Error::UnknownAgent(agent_id.to_string()))?;

        let contact_id: Uuid = sqlx::query_scalar(
            "INSERT INTO contacts (id, user_id, phone, source)
             VALUES ($1, $2, $3, 'inbound')
             ON CONFLICT (user_id, phone) DO UPDATE SET phone = EXCLUDED.phone
             RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(phone)
        .fetch_one(self.db.pool())
        .await?;

        let call_id = Uuid::new_v4();
        let mut tx = self.db.begin().await.map_err(Error::Internal)?;

        sqlx::query(
            "INSERT INTO calls (id, user_id, agent_id, contact_id, phone, execution_id, source, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(call_id)
        .bind(user_id)
        .bind(agent_id)
        .bind(contact_id)
        .bind(phone)
        .bind(&payload.execution_id)
        .bind(CallSource::Inbound)
        .bind(CallStatus::Initiated)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO active_calls (call_id, user_id, kind, execution_id) VALUES ($1, $2, 'inbound', $3)",
        )
        .bind(call_id)
        .bind(user_id)
        .bind(&payload.execution_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn handle_ringing(&self, payload: &WebhookPayload) -> Result<()> {
        let Some(timestamp) = payload.timestamp else { return Ok(()) };
        let Some(call) = self.find_by_execution_id(&payload.execution_id).await? else {
            return Ok(());
        };
        if !call.status.can_advance_to(CallStatus::Ringing) {
            return Ok(());
        }
        sqlx::query(
            "UPDATE calls SET ringing_started_at = $3, status = 'ringing'
             WHERE id = $1 AND status = $2",
        )
        .bind(call.id)
        .bind(call.status)
        .bind(timestamp)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn handle_in_progress(&self, payload: &WebhookPayload) -> Result<()> {
        let Some(timestamp) = payload.timestamp else { return Ok(()) };
        let Some(call) = self.find_by_execution_id(&payload.execution_id).await? else {
            return Ok(());
        };
        if !call.status.can_advance_to(CallStatus::InProgress) {
            return Ok(());
        }
        sqlx::query(
            "UPDATE calls SET call_answered_at = $3, status = 'in-progress'
             WHERE id = $1 AND status = $2",
        )
        .bind(call.id)
        .bind(call.status)
        .bind(timestamp)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn handle_call_disconnected(&self, payload: &WebhookPayload) -> Result<()> {
        let timestamp = payload.timestamp.unwrap_or_else(Utc::now);
        let Some(call) = self.find_by_execution_id(&payload.execution_id).await? else {
            return Ok(());
        };
        if !call.status.can_advance_to(CallStatus::CallDisconnected) {
            return Ok(());
        }
        sqlx::query(
            "UPDATE calls
             SET call_disconnected_at = COALESCE(call_disconnected_at, $3),
                 transcript = COALESCE(transcript, $4),
                 hangup_by = COALESCE(hangup_by, $5),
                 hangup_reason = COALESCE(hangup_reason, $6),
                 hangup_provider_code = COALESCE(hangup_provider_code, $7),
                 status = 'call-disconnected'
             WHERE id = $1 AND status = $2",
        )
        .bind(call.id)
        .bind(call.status)
        .bind(timestamp)
        .bind(&payload.transcript)
        .bind(&payload.hangup_by)
        .bind(&payload.hangup_reason)
        .bind(&payload.hangup_provider_code)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Folds the ledger debit, the Call update, the campaign counter, and the
    /// slot release into one transaction (spec.md §9): a failure partway
    /// through must not leave the debit recorded against a Call that never
    /// reached `completed`, since that would make the debit permanently
    /// unrepeatable on webhook replay.
    async fn handle_completed(&self, payload: &WebhookPayload) -> Result<()> {
        let Some(call) = self.find_by_execution_id(&payload.execution_id).await? else {
            warn!(execution_id = %payload.execution_id, "completed webhook for unknown call");
            return Ok(());
        };
        if !call.status.can_advance_to(CallStatus::Completed) {
            return Ok(());
        }
        let duration_seconds = payload.telephony_data.as_ref().map(|t| t.duration_seconds).unwrap_or(0);
        let credits = credits_for_duration(duration_seconds);

        let mut tx = self.db.begin().await.map_err(Error::Internal)?;

        let debited = self.ledger.debit_in_tx(&mut tx, call.user_id, credits, &call.id.to_string()).await?;
        if debited {
            sqlx::query(
                "UPDATE calls
                 SET status = 'completed', recording_url = $2, duration_seconds = $3, credits_consumed = $4
                 WHERE id = $1 AND status = $5",
            )
            .bind(call.id)
            .bind(&payload.recording_url)
            .bind(duration_seconds)
            .bind(credits)
            .bind(call.status)
            .execute(&mut *tx)
            .await?;

            if let Some(campaign_id) = call.campaign_id {
                sqlx::query("UPDATE campaigns SET completed_calls = completed_calls + 1 WHERE id = $1")
                    .bind(campaign_id)
                    .execute(&mut *tx)
                    .await?;
            }

            self.admission.release_by_execution_id_in_tx(&mut tx, &payload.execution_id).await?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn handle_terminal_failure(&self, payload: &WebhookPayload, status: CallStatus) -> Result<()> {
        let Some(call) = self.find_by_execution_id(&payload.execution_id).await? else {
            warn!(execution_id = %payload.execution_id, "terminal-failure webhook for unknown call");
            return Ok(());
        };
        if !call.status.can_advance_to(status) {
            return Ok(());
        }

        let mut tx = self.db.begin().await.map_err(Error::Internal)?;

        sqlx::query(
            "UPDATE calls
             SET status = $3, call_disconnected_at = COALESCE(call_disconnected_at, now())
             WHERE id = $1 AND status = $2",
        )
        .bind(call.id)
        .bind(call.status)
        .bind(status)
        .execute(&mut *tx)
        .await?;

        self.admission.release_by_execution_id_in_tx(&mut tx, &payload.execution_id).await?;

        tx.commit().await.map_err(Error::Database)?;

        if matches!(call.source, CallSource::Campaign) && call.campaign_id.is_some() {
            self.queue
                .enqueue(NewQueueEntry {
                    user_id: call.user_id,
                    agent_id: call.agent_id,
                    contact_id: call.contact_id,
                    phone: call.phone.clone(),
                    source: CallSource::Campaign,
                    campaign_id: call.campaign_id,
                    scheduled_for: Some(Utc::now() + chrono::Duration::seconds(CAMPAIGN_RETRY_BACKOFF_SECONDS)),
                })
                .await?;
        }
        Ok(())
    }
}
