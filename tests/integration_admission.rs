mod common;

use callctl::admission::{AdmissionController, AdmissionResult, ReserveRequest};
use callctl::db::models::CallSource;
use callctl::Error;
use serial_test::serial;
use uuid::Uuid;

fn direct_request(f: &common::Fixture) -> ReserveRequest {
    ReserveRequest {
        user_id: f.user_id,
        agent_id: f.agent_id,
        contact_id: f.contact_id,
        phone: "+15550000000".to_string(),
        source: CallSource::Direct,
        campaign_id: None,
    }
}

#[tokio::test]
#[serial]
async fn admits_when_under_both_limits() {
    let Some(db) = common::test_db().await else { return };
    let fixture = common::seed_user(&db, 50, 2).await;
    let admission = AdmissionController::new(db, 10, 2);

    let result = admission.reserve(Uuid::new_v4(), direct_request(&fixture)).await.unwrap();
    assert!(matches!(result, AdmissionResult::Admitted { .. }));
    assert_eq!(admission.active_slot_count().await.unwrap(), 1);
}

#[tokio::test]
#[serial]
async fn queues_once_the_user_limit_is_reached() {
    let Some(db) = common::test_db().await else { return };
    let fixture = common::seed_user(&db, 50, 1).await;
    let admission = AdmissionController::new(db, 10, 2);

    let first = admission.reserve(Uuid::new_v4(), direct_request(&fixture)).await.unwrap();
    assert!(matches!(first, AdmissionResult::Admitted { .. }));

    let second = admission.reserve(Uuid::new_v4(), direct_request(&fixture)).await.unwrap();
    match second {
        AdmissionResult::Queued { position, .. } => assert_eq!(position, 1),
        other => panic!("expected Queued, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn rejects_direct_calls_for_a_user_with_no_credit() {
    let Some(db) = common::test_db().await else { return };
    let fixture = common::seed_user(&db, 0, 2).await;
    let admission = AdmissionController::new(db, 10, 2);

    let err = admission.reserve(Uuid::new_v4(), direct_request(&fixture)).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientCredits { .. }));
}

#[tokio::test]
#[serial]
async fn rejects_unknown_users() {
    let Some(db) = common::test_db().await else { return };
    let admission = AdmissionController::new(db, 10, 2);

    let req = ReserveRequest {
        user_id: Uuid::new_v4(),
        agent_id: Uuid::new_v4(),
        contact_id: Uuid::new_v4(),
        phone: "+15550000000".to_string(),
        source: CallSource::Direct,
        campaign_id: None,
    };
    let err = admission.reserve(Uuid::new_v4(), req).await.unwrap_err();
    assert!(matches!(err, Error::UnknownUser(_)));
}

#[tokio::test]
#[serial]
async fn release_by_internal_id_frees_the_slot() {
    let Some(db) = common::test_db().await else { return };
    let fixture = common::seed_user(&db, 50, 2).await;
    let admission = AdmissionController::new(db, 10, 2);

    let call_id = Uuid::new_v4();
    admission.reserve(call_id, direct_request(&fixture)).await.unwrap();
    assert_eq!(admission.active_slot_count().await.unwrap(), 1);

    admission.release_by_internal_id(call_id).await.unwrap();
    assert_eq!(admission.active_slot_count().await.unwrap(), 0);

    // Idempotent: releasing again is a no-op, not an error.
    admission.release_by_internal_id(call_id).await.unwrap();
}

#[tokio::test]
#[serial]
async fn system_wide_limit_queues_even_with_user_capacity_left() {
    let Some(db) = common::test_db().await else { return };
    let fixture = common::seed_user(&db, 50, 5).await;
    let admission = AdmissionController::new(db, 1, 2);

    let first = admission.reserve(Uuid::new_v4(), direct_request(&fixture)).await.unwrap();
    assert!(matches!(first, AdmissionResult::Admitted { .. }));

    let second = admission.reserve(Uuid::new_v4(), direct_request(&fixture)).await.unwrap();
    assert!(matches!(second, AdmissionResult::Queued { .. }));
}
