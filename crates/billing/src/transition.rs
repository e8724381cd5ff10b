//! Subscription state transitions
//!
//! Every write to a subscription record goes through
//! [`apply_subscription_update`]: merge the update into the current record,
//! write it guarded by the version that was read, and refresh the account's
//! cached plan from the resolved entitlements. Concurrent writers race on the
//! version guard and the loser re-reads and retries.

use time::OffsetDateTime;
use uuid::Uuid;

use focusdeck_shared::{Plan, SubscriptionStatus};

use crate::entitlement::{resolve, EntitlementSnapshot};
use crate::error::{BillingError, BillingResult};
use crate::store::{Stores, SubscriptionRecord};

const MAX_WRITE_ATTEMPTS: u32 = 3;

/// A partial update to a subscription record. `None` fields keep whatever the
/// record already holds (or the field default when the record is being
/// created).
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub processor_subscription_id: Option<String>,
    pub processor_customer_id: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub plan: Option<Plan>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: Option<bool>,
    /// When the processor reported this state. Updates older than the
    /// record's last applied event are dropped, so reordered deliveries
    /// cannot overwrite newer state. `None` applies unconditionally.
    pub effective_at: Option<OffsetDateTime>,
}

impl SubscriptionUpdate {
    /// Terminal state: the processor subscription is gone
    pub fn canceled() -> Self {
        Self {
            status: Some(SubscriptionStatus::Canceled),
            plan: Some(Plan::Free),
            cancel_at_period_end: Some(false),
            ..Self::default()
        }
    }

    /// A payment attempt failed; plan is retained for the grace period
    pub fn payment_failed() -> Self {
        Self {
            status: Some(SubscriptionStatus::PastDue),
            ..Self::default()
        }
    }
}

fn merge(current: Option<&SubscriptionRecord>, account_id: Uuid, update: &SubscriptionUpdate) -> SubscriptionRecord {
    let now = OffsetDateTime::now_utc();
    match current {
        Some(existing) => SubscriptionRecord {
            account_id,
            processor_subscription_id: update
                .processor_subscription_id
                .clone()
                .or_else(|| existing.processor_subscription_id.clone()),
            processor_customer_id: update
                .processor_customer_id
                .clone()
                .or_else(|| existing.processor_customer_id.clone()),
            status: update.status.unwrap_or(existing.status),
            plan: update.plan.unwrap_or(existing.plan),
            current_period_start: update.current_period_start.or(existing.current_period_start),
            current_period_end: update.current_period_end.or(existing.current_period_end),
            cancel_at_period_end: update
                .cancel_at_period_end
                .unwrap_or(existing.cancel_at_period_end),
            last_event_at: update.effective_at.or(existing.last_event_at),
            version: existing.version + 1,
            updated_at: now,
        },
        None => SubscriptionRecord {
            account_id,
            processor_subscription_id: update.processor_subscription_id.clone(),
            processor_customer_id: update.processor_customer_id.clone(),
            status: update.status.unwrap_or(SubscriptionStatus::Incomplete),
            plan: update.plan.unwrap_or_default(),
            current_period_start: update.current_period_start,
            current_period_end: update.current_period_end,
            cancel_at_period_end: update.cancel_at_period_end.unwrap_or(false),
            last_event_at: update.effective_at,
            version: 1,
            updated_at: now,
        },
    }
}

/// Apply an update to the account's subscription record, creating the record
/// if absent, and refresh the cached plan. Returns the entitlements after the
/// write.
pub async fn apply_subscription_update(
    stores: &Stores,
    account_id: Uuid,
    update: &SubscriptionUpdate,
) -> BillingResult<EntitlementSnapshot> {
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        let current = stores.subscriptions.get(account_id).await?;

        // Deliveries can arrive out of order; an update carrying state older
        // than what's recorded is a no-op, not a rollback.
        if let (Some(existing), Some(effective)) = (current.as_ref(), update.effective_at) {
            if existing.last_event_at.is_some_and(|last| effective < last) {
                tracing::info!(
                    account_id = %account_id,
                    "Dropping out-of-order subscription update older than recorded state"
                );
                return Ok(resolve(Some(existing)));
            }
        }

        let next = merge(current.as_ref(), account_id, update);
        let expected = current.as_ref().map(|r| r.version);

        if stores
            .subscriptions
            .upsert_checked(&next, expected)
            .await?
        {
            let snapshot = resolve(Some(&next));
            stores
                .accounts
                .set_cached_plan(account_id, snapshot.plan)
                .await?;
            tracing::info!(
                account_id = %account_id,
                status = %next.status,
                plan = %snapshot.plan,
                version = next.version,
                "Subscription record updated"
            );
            return Ok(snapshot);
        }

        tracing::debug!(
            account_id = %account_id,
            attempt,
            "Lost subscription write race, retrying"
        );
    }

    Err(BillingError::WriteConflict(format!(
        "subscription for account {} kept changing underneath us",
        account_id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Stores;

    async fn seeded_stores() -> (Stores, Uuid) {
        let stores = Stores::in_memory();
        let (account, _) = stores
            .accounts
            .find_or_create("merge@example.com", None)
            .await
            .unwrap();
        (stores, account.id)
    }

    #[tokio::test]
    async fn test_update_creates_record_when_absent() {
        let (stores, account_id) = seeded_stores().await;
        let update = SubscriptionUpdate {
            processor_subscription_id: Some("sub_1".into()),
            processor_customer_id: Some("cus_1".into()),
            status: Some(SubscriptionStatus::Active),
            plan: Some(Plan::Pro),
            ..SubscriptionUpdate::default()
        };
        let snapshot = apply_subscription_update(&stores, account_id, &update)
            .await
            .unwrap();
        assert_eq!(snapshot.plan, Plan::Pro);
        assert!(snapshot.active);

        let record = stores.subscriptions.get(account_id).await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.status, SubscriptionStatus::Active);

        let account = stores.accounts.get(account_id).await.unwrap().unwrap();
        assert_eq!(account.cached_plan, Plan::Pro);
    }

    #[tokio::test]
    async fn test_none_fields_retain_existing_values() {
        let (stores, account_id) = seeded_stores().await;
        let initial = SubscriptionUpdate {
            processor_subscription_id: Some("sub_1".into()),
            processor_customer_id: Some("cus_1".into()),
            status: Some(SubscriptionStatus::Active),
            plan: Some(Plan::Enterprise),
            ..SubscriptionUpdate::default()
        };
        apply_subscription_update(&stores, account_id, &initial)
            .await
            .unwrap();

        // A payment failure carries no plan or ids; they must survive
        let snapshot =
            apply_subscription_update(&stores, account_id, &SubscriptionUpdate::payment_failed())
                .await
                .unwrap();
        assert_eq!(snapshot.plan, Plan::Enterprise);
        assert!(!snapshot.active);

        let record = stores.subscriptions.get(account_id).await.unwrap().unwrap();
        assert_eq!(record.plan, Plan::Enterprise);
        assert_eq!(record.processor_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(record.status, SubscriptionStatus::PastDue);
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn test_cancellation_downgrades_cached_plan() {
        let (stores, account_id) = seeded_stores().await;
        let initial = SubscriptionUpdate {
            status: Some(SubscriptionStatus::Active),
            plan: Some(Plan::Pro),
            ..SubscriptionUpdate::default()
        };
        apply_subscription_update(&stores, account_id, &initial)
            .await
            .unwrap();

        let snapshot =
            apply_subscription_update(&stores, account_id, &SubscriptionUpdate::canceled())
                .await
                .unwrap();
        assert_eq!(snapshot.plan, Plan::Free);

        let account = stores.accounts.get(account_id).await.unwrap().unwrap();
        assert_eq!(account.cached_plan, Plan::Free);
    }

    #[tokio::test]
    async fn test_out_of_order_update_does_not_roll_back_newer_state() {
        let (stores, account_id) = seeded_stores().await;
        let newer_ts = OffsetDateTime::from_unix_timestamp(1_700_000_200).unwrap();
        let older_ts = OffsetDateTime::from_unix_timestamp(1_700_000_100).unwrap();

        let newer = SubscriptionUpdate {
            processor_subscription_id: Some("sub_1".into()),
            status: Some(SubscriptionStatus::Active),
            plan: Some(Plan::Pro),
            effective_at: Some(newer_ts),
            ..SubscriptionUpdate::default()
        };
        apply_subscription_update(&stores, account_id, &newer)
            .await
            .unwrap();

        // A delivery reporting older state arrives late; it must not win
        let stale = SubscriptionUpdate {
            status: Some(SubscriptionStatus::PastDue),
            effective_at: Some(older_ts),
            ..SubscriptionUpdate::default()
        };
        let snapshot = apply_subscription_update(&stores, account_id, &stale)
            .await
            .unwrap();
        assert_eq!(snapshot.plan, Plan::Pro);
        assert!(snapshot.active);

        let record = stores.subscriptions.get(account_id).await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Active);
        // Dropped updates leave the record untouched
        assert_eq!(record.version, 1);
        assert_eq!(record.last_event_at, Some(newer_ts));
    }

    #[tokio::test]
    async fn test_undated_update_applies_over_dated_state() {
        let (stores, account_id) = seeded_stores().await;
        let dated = SubscriptionUpdate {
            status: Some(SubscriptionStatus::Active),
            plan: Some(Plan::Pro),
            effective_at: Some(OffsetDateTime::from_unix_timestamp(1_700_000_200).unwrap()),
            ..SubscriptionUpdate::default()
        };
        apply_subscription_update(&stores, account_id, &dated)
            .await
            .unwrap();

        // Updates without a processor timestamp keep arrival-order semantics
        let undated = SubscriptionUpdate::payment_failed();
        let snapshot = apply_subscription_update(&stores, account_id, &undated)
            .await
            .unwrap();
        assert!(!snapshot.active);
        let record = stores.subscriptions.get(account_id).await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::PastDue);
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn test_concurrent_updates_all_land() {
        let (stores, account_id) = seeded_stores().await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stores = stores.clone();
            handles.push(tokio::spawn(async move {
                let update = SubscriptionUpdate {
                    status: Some(SubscriptionStatus::Active),
                    plan: Some(Plan::Pro),
                    ..SubscriptionUpdate::default()
                };
                apply_subscription_update(&stores, account_id, &update).await
            }));
        }
        let mut succeeded = 0u64;
        for handle in handles {
            // A writer may exhaust its retries under contention; that's a
            // clean WriteConflict, never a corrupt record.
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(BillingError::WriteConflict(_)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(succeeded >= 1);
        let record = stores.subscriptions.get(account_id).await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Active);
        // Every successful write bumped the version exactly once
        assert_eq!(record.version, succeeded as i64);
    }
}
