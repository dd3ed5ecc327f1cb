//! Row types for the durable store (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub credit_balance: i64,
    pub concurrent_call_limit: i32,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_agent_id: String,
    pub active: bool,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub user_id: Uuid,
    pub phone: String,
    pub source: String,
}

/// Call source, per the glossary: direct calls queue at priority 100, campaign
/// calls at priority 0, inbound calls bypass admission entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum CallSource {
    Direct,
    Campaign,
    Inbound,
}

impl CallSource {
    /// Queue priority for this source, per spec.md §4.1 step 2/3 and §4.3.
    pub fn queue_priority(self) -> i32 {
        match self {
            CallSource::Direct => 100,
            CallSource::Campaign | CallSource::Inbound => 0,
        }
    }
}

/// Lifecycle status DAG (spec.md §4.6). Monotone — never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "kebab-case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    InProgress,
    CallDisconnected,
    Completed,
    Busy,
    NoAnswer,
    Failed,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Completed | CallStatus::Busy | CallStatus::NoAnswer | CallStatus::Failed
        )
    }

    /// DAG rank used to enforce monotonicity across webhook replays. Terminal
    /// states share the top rank — they don't order against each other, they
    /// just can't be left once entered.
    fn rank(self) -> u8 {
        match self {
            CallStatus::Initiated => 0,
            CallStatus::Ringing => 1,
            CallStatus::InProgress => 2,
            CallStatus::CallDisconnected => 3,
            CallStatus::Completed
            | CallStatus::Busy
            | CallStatus::NoAnswer
            | CallStatus::Failed => 4,
        }
    }

    /// Whether transitioning from `self` to `next` is allowed by the DAG.
    pub fn can_advance_to(self, next: CallStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Call {
    pub id: Uuid,
    pub user_id: Uuid,
    pub agent_id: Uuid,
    pub contact_id: Uuid,
    pub phone: String,
    pub execution_id: Option<String>,
    pub source: CallSource,
    pub status: CallStatus,
    pub ringing_started_at: Option<DateTime<Utc>>,
    pub call_answered_at: Option<DateTime<Utc>>,
    pub call_disconnected_at: Option<DateTime<Utc>>,
    pub hangup_by: Option<String>,
    pub hangup_reason: Option<String>,
    pub hangup_provider_code: Option<String>,
    pub transcript: Option<String>,
    pub recording_url: Option<String>,
    pub duration_seconds: Option<i32>,
    pub credits_consumed: Option<i64>,
    pub campaign_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Call kind as tracked by the Slot Registry — distinct from `CallSource`
/// because inbound calls occupy a slot of kind `inbound` without going
/// through admission (spec.md §9 Open Questions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum SlotKind {
    Direct,
    Campaign,
    Inbound,
}

#[derive(Debug, Clone, FromRow)]
pub struct SlotEntry {
    pub call_id: Uuid,
    pub user_id: Uuid,
    pub kind: SlotKind,
    pub reserved_at: DateTime<Utc>,
    pub execution_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, FromRow)]
pub struct QueueEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub agent_id: Uuid,
    pub contact_id: Uuid,
    pub phone: String,
    pub source: CallSource,
    pub campaign_id: Option<Uuid>,
    pub priority: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub status: QueueStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "kebab-case")]
pub enum LedgerReason {
    CallDebit,
    Purchase,
    Bonus,
    Adjustment,
}

#[derive(Debug, Clone, FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub delta: i64,
    pub reason: LedgerReason,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Campaign {
    pub id: Uuid,
    pub user_id: Uuid,
    pub timezone: String,
    /// Local time-of-day window, minutes since midnight.
    pub window_start_minute: i32,
    pub window_end_minute: i32,
}
