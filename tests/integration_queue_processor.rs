mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callctl::admission::AdmissionController;
use callctl::db::models::CallSource;
use callctl::error::{Error, Result};
use callctl::provider::VoiceProviderAdapter;
use callctl::queue::store::NewQueueEntry;
use callctl::queue::{QueueProcessor, QueueStore};
use serial_test::serial;
use uuid::Uuid;

/// Fails dispatch until `succeed_after` calls have been made, then succeeds.
struct FlakyAdapter {
    calls: AtomicUsize,
    succeed_after: usize,
}

#[async_trait]
impl VoiceProviderAdapter for FlakyAdapter {
    async fn start_call(&self, _call_id: Uuid, _phone: &str, _agent_id: Uuid) -> Result<String> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.succeed_after {
            Err(Error::Timeout)
        } else {
            Ok(format!("exec-{attempt}"))
        }
    }
}

struct AlwaysFailsAdapter;

#[async_trait]
impl VoiceProviderAdapter for AlwaysFailsAdapter {
    async fn start_call(&self, _call_id: Uuid, _phone: &str, _agent_id: Uuid) -> Result<String> {
        Err(Error::Timeout)
    }
}

#[tokio::test]
#[serial]
async fn dispatch_failure_retries_with_backoff_instead_of_completing() {
    let Some(db) = common::test_db().await else { return };
    let fixture = common::seed_user(&db, 50, 2).await;
    let admission = AdmissionController::new(db.clone(), 10, 2);
    let queue = QueueStore::new(db.clone());
    let provider: Arc<dyn VoiceProviderAdapter> = Arc::new(AlwaysFailsAdapter);
    let processor =
        QueueProcessor::new(db.clone(), admission.clone(), provider, Duration::from_secs(60), 3);

    let entry_id = queue
        .enqueue(NewQueueEntry {
            user_id: fixture.user_id,
            agent_id: fixture.agent_id,
            contact_id: fixture.contact_id,
            phone: "+15550000000".to_string(),
            source: CallSource::Campaign,
            campaign_id: None,
            scheduled_for: None,
        })
        .await
        .unwrap();

    processor.tick().await.unwrap();

    let (status, attempts): (String, i32) =
        sqlx::query_as("SELECT status, attempts FROM call_queue WHERE id = $1")
            .bind(entry_id)
            .fetch_one(db.pool())
            .await
            .unwrap();
    assert_eq!(status, "queued");
    assert_eq!(attempts, 1);

    // The provider failure must not have left the slot reserved.
    assert_eq!(admission.active_slot_count().await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn dispatch_failure_eventually_marks_the_entry_failed() {
    let Some(db) = common::test_db().await else { return };
    let fixture = common::seed_user(&db, 50, 2).await;
    let admission = AdmissionController::new(db.clone(), 10, 2);
    let queue = QueueStore::new(db.clone());
    let provider: Arc<dyn VoiceProviderAdapter> = Arc::new(AlwaysFailsAdapter);
    let processor =
        QueueProcessor::new(db.clone(), admission.clone(), provider, Duration::from_secs(60), 2);

    let entry_id = queue
        .enqueue(NewQueueEntry {
            user_id: fixture.user_id,
            agent_id: fixture.agent_id,
            contact_id: fixture.contact_id,
            phone: "+15550000000".to_string(),
            source: CallSource::Campaign,
            campaign_id: None,
            scheduled_for: None,
        })
        .await
        .unwrap();

    // First tick: attempt 1, re-queued with a future scheduled_for.
    processor.tick().await.unwrap();
    // Force the backoff window open so the second tick can claim it again.
    sqlx::query("UPDATE call_queue SET scheduled_for = NULL WHERE id = $1")
        .bind(entry_id)
        .execute(db.pool())
        .await
        .unwrap();

    // Second tick: attempt 2 reaches max_attempts, entry marked failed.
    processor.tick().await.unwrap();

    let status: String = sqlx::query_scalar("SELECT status FROM call_queue WHERE id = $1")
        .bind(entry_id)
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(status, "failed");
}

#[tokio::test]
#[serial]
async fn successful_dispatch_removes_the_queue_entry() {
    let Some(db) = common::test_db().await else { return };
    let fixture = common::seed_user(&db, 50, 2).await;
    let admission = AdmissionController::new(db.clone(), 10, 2);
    let queue = QueueStore::new(db.clone());
    let provider: Arc<dyn VoiceProviderAdapter> =
        Arc::new(FlakyAdapter { calls: AtomicUsize::new(0), succeed_after: 0 });
    let processor =
        QueueProcessor::new(db.clone(), admission.clone(), provider, Duration::from_secs(60), 3);

    let entry_id = queue
        .enqueue(NewQueueEntry {
            user_id: fixture.user_id,
            agent_id: fixture.agent_id,
            contact_id: fixture.contact_id,
            phone: "+15550000000".to_string(),
            source: CallSource::Campaign,
            campaign_id: None,
            scheduled_for: None,
        })
        .await
        .unwrap();

    processor.tick().await.unwrap();

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM call_queue WHERE id = $1")
        .bind(entry_id)
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(remaining, 0);
    assert_eq!(admission.active_slot_count().await.unwrap(), 1);
}
