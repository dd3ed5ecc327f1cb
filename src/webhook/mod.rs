//! HTTP surface: the Voice Provider webhook ingress plus the minimal
//! direct-call admission endpoint (spec.md §4.5, §6).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::admission::{AdmissionResult, ReserveRequest};
use crate::db::models::CallSource;
use crate::error::Result;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct PlaceCallRequest {
    pub user_id: Uuid,
    pub agent_id: Uuid,
    pub contact_id: Uuid,
    pub phone: String,
    #[serde(default)]
    pub campaign_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlaceCallResponse {
    Admitted { call_id: Uuid },
    Queued { queue_entry_id: Uuid, position: i64, estimated_wait_seconds: i64 },
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/calls", post(place_call))
        .route("/webhooks/voice", post(handle_webhook))
        .route("/healthz", get(healthz))
        .with_state(Arc::new(state))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn place_call(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlaceCallRequest>,
) -> Result<Json<PlaceCallResponse>> {
    let call_id = Uuid::new_v4();
    let phone = req.phone.clone();
    let agent_id = req.agent_id;
    let result = state
        .admission
        .reserve(
            call_id,
            ReserveRequest {
                user_id: req.user_id,
                agent_id: req.agent_id,
                contact_id: req.contact_id,
                phone: req.phone,
                source: CallSource::Direct,
                campaign_id: req.campaign_id,
            },
        )
        .await?;

    match result {
        AdmissionResult::Admitted { call_id } => {
            dispatch_admitted_call(&state, call_id, phone, agent_id).await;
            Ok(Json(PlaceCallResponse::Admitted { call_id }))
        }
        AdmissionResult::Queued { queue_entry_id, position, estimated_wait_seconds } => {
            Ok(Json(PlaceCallResponse::Queued { queue_entry_id, position, estimated_wait_seconds }))
        }
    }
}

async fn dispatch_admitted_call(state: &AppState, call_id: Uuid, phone: String, agent_id: Uuid) {
    match state.provider.start_call(call_id, &phone, agent_id).await {
        Ok(execution_id) => {
            if let Err(e) = state.admission.attach_execution_id(call_id, &execution_id).await {
                warn!(error = %e, %call_id, "failed to record execution id");
            }
        }
        Err(e) => {
            warn!(error = %e, %call_id, "voice provider dispatch failed, releasing slot");
            if let Err(e) = state.admission.release_by_internal_id(call_id).await {
                warn!(error = %e, %call_id, "failed to release slot after dispatch failure");
            }
            let _ = sqlx::query(
                "UPDATE calls SET status = 'failed', hangup_reason = 'provider_timeout' WHERE id = $1",
            )
            .bind(call_id)
            .execute(state.db.pool())
            .await;
        }
    }
}

/// Always answers 200, per spec.md §4.5 — processing failures are logged,
/// never surfaced to the provider.
async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Json<serde_json::Value> {
    match serde_json::from_slice::<crate::lifecycle::WebhookPayload>(&body) {
        Ok(payload) => state.lifecycle.handle(payload).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to parse webhook payload");
        }
    }
    Json(json!({ "success": true }))
}
