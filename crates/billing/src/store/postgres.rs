//! Postgres store implementations
//!
//! All atomicity comes from single statements: `ON CONFLICT DO NOTHING ...
//! RETURNING` for find-or-create and event claims, and a version predicate in
//! the UPDATE for the subscription compare-and-swap. No explicit transactions
//! are needed.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use focusdeck_shared::Plan;

use crate::error::{BillingError, BillingResult};

use super::{
    normalize_email, Account, AccountStore, ClaimOutcome, SubscriptionRecord, SubscriptionStore,
    WebhookEventStore, STUCK_CLAIM_TIMEOUT,
};

pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn get(&self, id: Uuid) -> BillingResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, email, display_name, cached_plan, created_at, updated_at
             FROM accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn find_by_email(&self, email: &str) -> BillingResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, email, display_name, cached_plan, created_at, updated_at
             FROM accounts WHERE email = $1",
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn find_or_create(
        &self,
        email: &str,
        display_name: Option<&str>,
    ) -> BillingResult<(Account, bool)> {
        let normalized = normalize_email(email);

        // The unique index on email arbitrates concurrent creates; losers get
        // no row back and re-read the winner's.
        let inserted = sqlx::query_as::<_, Account>(
            "INSERT INTO accounts (id, email, display_name, cached_plan, created_at, updated_at)
             VALUES ($1, $2, $3, $4, NOW(), NOW())
             ON CONFLICT (email) DO NOTHING
             RETURNING id, email, display_name, cached_plan, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(&normalized)
        .bind(display_name)
        .bind(Plan::Free)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(account) = inserted {
            return Ok((account, true));
        }

        let existing = self.find_by_email(&normalized).await?.ok_or_else(|| {
            BillingError::Storage(format!("account for {} vanished during create", normalized))
        })?;
        Ok((existing, false))
    }

    async fn set_cached_plan(&self, id: Uuid, plan: Plan) -> BillingResult<()> {
        let result =
            sqlx::query("UPDATE accounts SET cached_plan = $1, updated_at = NOW() WHERE id = $2")
                .bind(plan)
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("account {}", id)));
        }
        Ok(())
    }
}

pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn get(&self, account_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            "SELECT account_id, processor_subscription_id, processor_customer_id, status, plan,
                    current_period_start, current_period_end, cancel_at_period_end, last_event_at,
                    version, updated_at
             FROM subscriptions WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn account_for_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let account_id: Option<(Uuid,)> = sqlx::query_as(
            "SELECT account_id FROM subscriptions WHERE processor_customer_id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account_id.map(|(id,)| id))
    }

    async fn upsert_checked(
        &self,
        record: &SubscriptionRecord,
        expected_version: Option<i64>,
    ) -> BillingResult<bool> {
        let result = match expected_version {
            None => {
                sqlx::query(
                    "INSERT INTO subscriptions
                        (account_id, processor_subscription_id, processor_customer_id, status,
                         plan, current_period_start, current_period_end, cancel_at_period_end,
                         last_event_at, version, updated_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
                     ON CONFLICT (account_id) DO NOTHING",
                )
                .bind(record.account_id)
                .bind(&record.processor_subscription_id)
                .bind(&record.processor_customer_id)
                .bind(record.status)
                .bind(record.plan)
                .bind(record.current_period_start)
                .bind(record.current_period_end)
                .bind(record.cancel_at_period_end)
                .bind(record.last_event_at)
                .bind(record.version)
                .execute(&self.pool)
                .await?
            }
            Some(version) => {
                sqlx::query(
                    "UPDATE subscriptions SET
                        processor_subscription_id = $2,
                        processor_customer_id = $3,
                        status = $4,
                        plan = $5,
                        current_period_start = $6,
                        current_period_end = $7,
                        cancel_at_period_end = $8,
                        last_event_at = $9,
                        version = $10,
                        updated_at = NOW()
                     WHERE account_id = $1 AND version = $11",
                )
                .bind(record.account_id)
                .bind(&record.processor_subscription_id)
                .bind(&record.processor_customer_id)
                .bind(record.status)
                .bind(record.plan)
                .bind(record.current_period_start)
                .bind(record.current_period_end)
                .bind(record.cancel_at_period_end)
                .bind(record.last_event_at)
                .bind(record.version)
                .bind(version)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }
}

pub struct PgWebhookEventStore {
    pool: PgPool,
}

impl PgWebhookEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEventStore for PgWebhookEventStore {
    async fn try_claim(&self, event_id: &str) -> BillingResult<ClaimOutcome> {
        // The conflict arm retakes claims whose holder never finished
        // (dropped connection, crash before release); anything younger than
        // the cutoff stays with its current holder.
        let cutoff = time::OffsetDateTime::now_utc() - STUCK_CLAIM_TIMEOUT;
        let claimed: Option<(String,)> = sqlx::query_as(
            "INSERT INTO webhook_events (processor_event_id, status, claimed_at)
             VALUES ($1, 'processing', NOW())
             ON CONFLICT (processor_event_id) DO UPDATE
                SET status = 'processing', claimed_at = NOW()
                WHERE webhook_events.status = 'processing'
                  AND webhook_events.claimed_at < $2
             RETURNING processor_event_id",
        )
        .bind(event_id)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM webhook_events WHERE processor_event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;

        match status.as_ref().map(|(s,)| s.as_str()) {
            Some("processed") => Ok(ClaimOutcome::AlreadyProcessed),
            // Row deleted between the insert and the select; treat as held,
            // the processor will redeliver.
            _ => Ok(ClaimOutcome::InFlight),
        }
    }

    async fn mark_processed(&self, event_id: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE webhook_events SET status = 'processed', processed_at = NOW()
             WHERE processor_event_id = $1",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, event_id: &str) -> BillingResult<()> {
        sqlx::query(
            "DELETE FROM webhook_events
             WHERE processor_event_id = $1 AND status = 'processing'",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
