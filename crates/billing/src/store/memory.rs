//! In-memory store implementation
//!
//! Backs tests and local development without a database. A single mutex
//! guards all tables, which keeps the find-or-create and claim operations
//! atomic the same way the Postgres statements are.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use focusdeck_shared::Plan;

use crate::error::{BillingError, BillingResult};

use super::{
    normalize_email, Account, AccountStore, ClaimOutcome, SubscriptionRecord, SubscriptionStore,
    WebhookEventStore, STUCK_CLAIM_TIMEOUT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventState {
    Processing { claimed_at: OffsetDateTime },
    Processed,
}

#[derive(Default)]
struct Tables {
    accounts: HashMap<Uuid, Account>,
    accounts_by_email: HashMap<String, Uuid>,
    subscriptions: HashMap<Uuid, SubscriptionRecord>,
    webhook_events: HashMap<String, EventState>,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get(&self, id: Uuid) -> BillingResult<Option<Account>> {
        Ok(self.lock().accounts.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> BillingResult<Option<Account>> {
        let normalized = normalize_email(email);
        let tables = self.lock();
        Ok(tables
            .accounts_by_email
            .get(&normalized)
            .and_then(|id| tables.accounts.get(id))
            .cloned())
    }

    async fn find_or_create(
        &self,
        email: &str,
        display_name: Option<&str>,
    ) -> BillingResult<(Account, bool)> {
        let normalized = normalize_email(email);
        let mut tables = self.lock();
        if let Some(id) = tables.accounts_by_email.get(&normalized).copied() {
            let account = tables
                .accounts
                .get(&id)
                .cloned()
                .ok_or_else(|| BillingError::Storage("email index points at missing row".into()))?;
            return Ok((account, false));
        }
        let now = OffsetDateTime::now_utc();
        let account = Account {
            id: Uuid::new_v4(),
            email: normalized.clone(),
            display_name: display_name.map(String::from),
            cached_plan: Plan::Free,
            created_at: now,
            updated_at: now,
        };
        tables.accounts_by_email.insert(normalized, account.id);
        tables.accounts.insert(account.id, account.clone());
        Ok((account, true))
    }

    async fn set_cached_plan(&self, id: Uuid, plan: Plan) -> BillingResult<()> {
        let mut tables = self.lock();
        match tables.accounts.get_mut(&id) {
            Some(account) => {
                account.cached_plan = plan;
                account.updated_at = OffsetDateTime::now_utc();
                Ok(())
            }
            None => Err(BillingError::NotFound(format!("account {}", id))),
        }
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn get(&self, account_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.lock().subscriptions.get(&account_id).cloned())
    }

    async fn account_for_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .find(|r| r.processor_customer_id.as_deref() == Some(customer_id))
            .map(|r| r.account_id))
    }

    async fn upsert_checked(
        &self,
        record: &SubscriptionRecord,
        expected_version: Option<i64>,
    ) -> BillingResult<bool> {
        let mut tables = self.lock();
        let current = tables.subscriptions.get(&record.account_id);
        let guard_holds = match (expected_version, current) {
            (None, None) => true,
            (Some(v), Some(existing)) => existing.version == v,
            _ => false,
        };
        if !guard_holds {
            return Ok(false);
        }
        tables
            .subscriptions
            .insert(record.account_id, record.clone());
        Ok(true)
    }
}

#[async_trait]
impl WebhookEventStore for MemoryStore {
    async fn try_claim(&self, event_id: &str) -> BillingResult<ClaimOutcome> {
        let now = OffsetDateTime::now_utc();
        let mut tables = self.lock();
        match tables.webhook_events.get(event_id) {
            Some(EventState::Processed) => Ok(ClaimOutcome::AlreadyProcessed),
            Some(EventState::Processing { claimed_at })
                if now - *claimed_at < STUCK_CLAIM_TIMEOUT =>
            {
                Ok(ClaimOutcome::InFlight)
            }
            // Absent, or a claim whose holder never finished
            _ => {
                tables
                    .webhook_events
                    .insert(event_id.to_string(), EventState::Processing { claimed_at: now });
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn mark_processed(&self, event_id: &str) -> BillingResult<()> {
        self.lock()
            .webhook_events
            .insert(event_id.to_string(), EventState::Processed);
        Ok(())
    }

    async fn release(&self, event_id: &str) -> BillingResult<()> {
        let mut tables = self.lock();
        if let Some(EventState::Processing { .. }) = tables.webhook_events.get(event_id) {
            tables.webhook_events.remove(event_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Stores;
    use focusdeck_shared::SubscriptionStatus;

    fn record(account_id: Uuid, version: i64) -> SubscriptionRecord {
        SubscriptionRecord {
            account_id,
            processor_subscription_id: Some("sub_test".into()),
            processor_customer_id: Some("cus_test".into()),
            status: SubscriptionStatus::Active,
            plan: Plan::Pro,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            last_event_at: None,
            version,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent_per_email() {
        let stores = Stores::in_memory();
        let (first, created) = stores
            .accounts
            .find_or_create("User@Example.com", None)
            .await
            .unwrap();
        assert!(created);
        let (second, created) = stores
            .accounts
            .find_or_create("user@example.COM ", None)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.email, "user@example.com");
    }

    #[tokio::test]
    async fn test_version_guard_rejects_stale_writes() {
        let stores = Stores::in_memory();
        let account_id = Uuid::new_v4();

        // Insert requires the row to be absent
        assert!(stores
            .subscriptions
            .upsert_checked(&record(account_id, 1), None)
            .await
            .unwrap());
        // Second insert loses
        assert!(!stores
            .subscriptions
            .upsert_checked(&record(account_id, 1), None)
            .await
            .unwrap());
        // Update at the right version wins
        assert!(stores
            .subscriptions
            .upsert_checked(&record(account_id, 2), Some(1))
            .await
            .unwrap());
        // Stale version loses
        assert!(!stores
            .subscriptions
            .upsert_checked(&record(account_id, 2), Some(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_claim_lifecycle() {
        let stores = Stores::in_memory();
        assert_eq!(
            stores.webhook_events.try_claim("evt_1").await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            stores.webhook_events.try_claim("evt_1").await.unwrap(),
            ClaimOutcome::InFlight
        );

        // Released claims can be retaken
        stores.webhook_events.release("evt_1").await.unwrap();
        assert_eq!(
            stores.webhook_events.try_claim("evt_1").await.unwrap(),
            ClaimOutcome::Claimed
        );

        // Processed events stay processed
        stores.webhook_events.mark_processed("evt_1").await.unwrap();
        assert_eq!(
            stores.webhook_events.try_claim("evt_1").await.unwrap(),
            ClaimOutcome::AlreadyProcessed
        );
        stores.webhook_events.release("evt_1").await.unwrap();
        assert_eq!(
            stores.webhook_events.try_claim("evt_1").await.unwrap(),
            ClaimOutcome::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn test_abandoned_claim_is_retaken_after_timeout() {
        let store = MemoryStore::new();
        assert_eq!(
            store.try_claim("evt_stuck").await.unwrap(),
            ClaimOutcome::Claimed
        );
        // A live claim still blocks concurrent deliveries
        assert_eq!(
            store.try_claim("evt_stuck").await.unwrap(),
            ClaimOutcome::InFlight
        );

        // Age the claim past the abandonment cutoff, as if the holder died
        // between claiming and releasing
        {
            let mut tables = store.lock();
            if let Some(EventState::Processing { claimed_at }) =
                tables.webhook_events.get_mut("evt_stuck")
            {
                *claimed_at -= STUCK_CLAIM_TIMEOUT + time::Duration::minutes(1);
            }
        }

        // The next delivery takes the claim over and can finish the event
        assert_eq!(
            store.try_claim("evt_stuck").await.unwrap(),
            ClaimOutcome::Claimed
        );
        store.mark_processed("evt_stuck").await.unwrap();
        assert_eq!(
            store.try_claim("evt_stuck").await.unwrap(),
            ClaimOutcome::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn test_customer_reverse_lookup() {
        let stores = Stores::in_memory();
        let account_id = Uuid::new_v4();
        stores
            .subscriptions
            .upsert_checked(&record(account_id, 1), None)
            .await
            .unwrap();
        assert_eq!(
            stores
                .subscriptions
                .account_for_customer("cus_test")
                .await
                .unwrap(),
            Some(account_id)
        );
        assert_eq!(
            stores
                .subscriptions
                .account_for_customer("cus_other")
                .await
                .unwrap(),
            None
        );
    }
}
