//! Shared test setup. Requires a reachable Postgres instance; point
//! `DATABASE_URL` at a scratch database. Tests skip (rather than fail) when
//! it isn't set, since the integration suite cannot run without one.

use callctl::db::DatabaseManager;
use uuid::Uuid;

pub async fn test_db() -> Option<DatabaseManager> {
    let url = std::env::var("DATABASE_URL").ok()?;
    match DatabaseManager::new(&url).await {
        Ok(db) => {
            reset(&db).await;
            Some(db)
        }
        Err(e) => {
            eprintln!("skipping integration test: could not reach test database: {e}");
            None
        }
    }
}

async fn reset(db: &DatabaseManager) {
    sqlx::query(
        "TRUNCATE credit_ledger, call_queue, active_calls, calls, contacts, agents, campaigns, users CASCADE",
    )
    .execute(db.pool())
    .await
    .expect("failed to reset test database");
}

pub struct Fixture {
    pub user_id: Uuid,
    pub agent_id: Uuid,
    pub contact_id: Uuid,
}

/// Inserts a user with the given balance/limit, an agent owned by that
/// user, and a contact, returning their ids for use in a test.
pub async fn seed_user(db: &DatabaseManager, credit_balance: i64, concurrent_call_limit: i32) -> Fixture {
    let user_id = Uuid::new_v4();
    let agent_id = Uuid::new_v4();
    let contact_id = Uuid::new_v4();

    sqlx::query("INSERT INTO users (id, credit_balance, concurrent_call_limit) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(credit_balance)
        .bind(concurrent_call_limit)
        .execute(db.pool())
        .await
        .expect("insert user");

    sqlx::query("INSERT INTO agents (id, user_id, provider_agent_id, active) VALUES ($1, $2, 'agent-1', true)")
        .bind(agent_id)
        .bind(user_id)
        .execute(db.pool())
        .await
        .expect("insert agent");

    sqlx::query("INSERT INTO contacts (id, user_id, phone, source) VALUES ($1, $2, '+15550000000', 'direct')")
        .bind(contact_id)
        .bind(user_id)
        .execute(db.pool())
        .await
        .expect("insert contact");

    Fixture { user_id, agent_id, contact_id }
}
