//! Persistence seams for billing state
//!
//! Three stores back the billing engine: accounts, subscription records, and
//! webhook event markers. Each is a trait so the engine can run against
//! Postgres in production and an in-memory implementation in tests.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use focusdeck_shared::{Plan, SubscriptionStatus};

use crate::error::BillingResult;

/// A billable account. `cached_plan` is denormalized from the subscription
/// record on every entitlement change so read paths never need a join.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub cached_plan: Plan,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Local mirror of one account's processor subscription. At most one row per
/// account; `version` increments on every write and backs the
/// compare-and-swap in the transition layer.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub account_id: Uuid,
    pub processor_subscription_id: Option<String>,
    pub processor_customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub plan: Plan,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    /// When the processor reported the applied state; used to drop reordered
    /// webhook deliveries that carry older state
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_at: Option<OffsetDateTime>,
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A `processing` claim older than this is considered abandoned (handler
/// dropped mid-flight, process crash) and may be retaken by a redelivery.
pub(crate) const STUCK_CLAIM_TIMEOUT: time::Duration = time::Duration::seconds(30 * 60);

/// Result of attempting to claim a webhook event for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns the event and must process it
    Claimed,
    /// A previous delivery already applied this event
    AlreadyProcessed,
    /// Another delivery holds the claim right now
    InFlight,
}

/// Canonical form for account emails: trimmed and lowercased. Applied before
/// every store lookup and insert so case variants hit the same row.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, id: Uuid) -> BillingResult<Option<Account>>;

    async fn find_by_email(&self, email: &str) -> BillingResult<Option<Account>>;

    /// Look up an account by normalized email, creating it if absent.
    /// Must be atomic under concurrent calls for the same email: exactly one
    /// row is ever created. Returns the account and whether it was created.
    async fn find_or_create(
        &self,
        email: &str,
        display_name: Option<&str>,
    ) -> BillingResult<(Account, bool)>;

    async fn set_cached_plan(&self, id: Uuid, plan: Plan) -> BillingResult<()>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, account_id: Uuid) -> BillingResult<Option<SubscriptionRecord>>;

    /// Reverse lookup from processor customer id to account
    async fn account_for_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>>;

    /// Write a record guarded by the version the caller read.
    ///
    /// `expected_version: None` means "insert, the row must not exist yet";
    /// `Some(v)` means "update, the row must still be at version v". Returns
    /// false when the guard fails, so callers can re-read and retry.
    async fn upsert_checked(
        &self,
        record: &SubscriptionRecord,
        expected_version: Option<i64>,
    ) -> BillingResult<bool>;
}

#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Atomically claim a processor event id for processing.
    ///
    /// A claim left in `processing` longer than the stuck-claim timeout was
    /// abandoned and must be retaken, so a delivery dropped mid-application
    /// cannot block the event forever.
    async fn try_claim(&self, event_id: &str) -> BillingResult<ClaimOutcome>;

    /// Record that a claimed event was fully applied
    async fn mark_processed(&self, event_id: &str) -> BillingResult<()>;

    /// Drop an unfinished claim so a redelivery can process the event
    async fn release(&self, event_id: &str) -> BillingResult<()>;
}

/// Bundle of the three stores, cloned into every service
#[derive(Clone)]
pub struct Stores {
    pub accounts: Arc<dyn AccountStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub webhook_events: Arc<dyn WebhookEventStore>,
}

impl Stores {
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self {
            accounts: Arc::new(postgres::PgAccountStore::new(pool.clone())),
            subscriptions: Arc::new(postgres::PgSubscriptionStore::new(pool.clone())),
            webhook_events: Arc::new(postgres::PgWebhookEventStore::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        let store = Arc::new(memory::MemoryStore::new());
        Self {
            accounts: store.clone(),
            subscriptions: store.clone(),
            webhook_events: store,
        }
    }
}
