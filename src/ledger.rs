//! Credit ledger (spec.md §4.7): an append-only log of balance deltas plus
//! a cached balance on `users`, kept in sync in the same transaction.

use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::db::models::LedgerReason;
use crate::db::DatabaseManager;
use crate::error::{Error, Result};
use crate::hash::hash_identifier;

#[derive(Clone)]
pub struct CreditLedger {
    db: DatabaseManager,
}

impl CreditLedger {
    pub fn new(db: DatabaseManager) -> Self {
        Self { db }
    }

    /// Debits `amount` credits from `user_id`, identified by `reference`
    /// (the call id) so retries of the same debit are no-ops rather than
    /// double-charges. Returns `true` if this call actually applied the
    /// debit, `false` if `reference` was already recorded.
    pub async fn debit(&self, user_id: Uuid, amount: i64, reference: &str) -> Result<bool> {
        let mut tx = self.db.begin().await.map_err(Error::Internal)?;
        let applied = self.debit_in_tx(&mut tx, user_id, amount, reference).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(applied)
    }

    /// Same as [`Self::debit`], but runs inside a transaction the caller
    /// already holds open, so the debit commits atomically with whatever
    /// else that transaction does (spec.md §9: ledger write, balance
    /// update, Call update, and slot release happen in one transaction).
    pub async fn debit_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        amount: i64,
        reference: &str,
    ) -> Result<bool> {
        self.apply_in_tx(tx, user_id, -amount, LedgerReason::CallDebit, reference).await
    }

    async fn apply_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        delta: i64,
        reason: LedgerReason,
        reference: &str,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO credit_ledger (id, user_id, delta, reason, reference)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (user_id, reference) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(delta)
        .bind(reason)
        .bind(reference)
        .execute(&mut **tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Ok(false);
        }

        // Balance never goes negative even if a debit would overdraw it
        // (spec.md §4.7 boundary: balance clamps at zero).
        sqlx::query(
            "UPDATE users SET credit_balance = GREATEST(0, credit_balance + $2) WHERE id = $1",
        )
        .bind(user_id)
        .bind(delta)
        .execute(&mut **tx)
        .await?;

        Ok(true)
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<i64> {
        let balance: i64 = sqlx::query_scalar("SELECT credit_balance FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| Error::UnknownUser(hash_identifier(&user_id.to_string())))?;
        Ok(balance)
    }
}

/// `ceil(duration_seconds / 60)`, per spec.md §4.6: any partial minute is
/// billed as a full minute.
pub fn credits_for_duration(duration_seconds: i32) -> i64 {
    i64::from((duration_seconds + 59) / 60).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_partial_minutes_up() {
        assert_eq!(credits_for_duration(0), 0);
        assert_eq!(credits_for_duration(1), 1);
        assert_eq!(credits_for_duration(60), 1);
        assert_eq!(credits_for_duration(61), 2);
        assert_eq!(credits_for_duration(119), 2);
        assert_eq!(credits_for_duration(120), 2);
    }
}
