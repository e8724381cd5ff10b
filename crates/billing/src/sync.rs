//! Reconciliation against the processor
//!
//! The webhook stream is the normal source of truth updates; sync is the
//! repair path for missed or out-of-order deliveries. It pulls the customer's
//! newest subscription from the processor and applies it through the same
//! transition layer the webhooks use, so repeated syncs converge on the same
//! record.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::ProcessorClient;
use crate::entitlement::{resolve, EntitlementSnapshot};
use crate::error::{BillingError, BillingResult};
use crate::notify::NotificationSink;
use crate::store::Stores;
use crate::transition::{apply_subscription_update, SubscriptionUpdate};

/// Result of a sync. `pending` means no processor customer is linked yet, so
/// there was nothing to reconcile against; the checkout webhook has not
/// arrived.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub snapshot: EntitlementSnapshot,
    pub pending: bool,
}

#[derive(Clone)]
pub struct SyncService {
    processor: Arc<dyn ProcessorClient>,
    stores: Stores,
    notifier: NotificationSink,
}

impl SyncService {
    pub fn new(
        processor: Arc<dyn ProcessorClient>,
        stores: Stores,
        notifier: NotificationSink,
    ) -> Self {
        Self {
            processor,
            stores,
            notifier,
        }
    }

    pub async fn sync(&self, account_id: Uuid) -> BillingResult<SyncOutcome> {
        if self.stores.accounts.get(account_id).await?.is_none() {
            return Err(BillingError::NotFound(format!("account {}", account_id)));
        }
        let record = self.stores.subscriptions.get(account_id).await?;

        let Some(customer_id) = record
            .as_ref()
            .and_then(|r| r.processor_customer_id.clone())
        else {
            tracing::info!(account_id = %account_id, "No linked processor customer, nothing to sync");
            return Ok(SyncOutcome {
                snapshot: resolve(record.as_ref()),
                pending: true,
            });
        };

        // The pull reflects processor state as of now, so it outranks any
        // earlier webhook still in flight
        let observed_at = Some(OffsetDateTime::now_utc());
        let update = match self.processor.latest_subscription(&customer_id).await? {
            Some(subscription) => {
                tracing::info!(
                    account_id = %account_id,
                    subscription_id = %subscription.id,
                    status = %subscription.status,
                    "Reconciling from processor state"
                );
                SubscriptionUpdate {
                    processor_subscription_id: Some(subscription.id),
                    processor_customer_id: Some(customer_id),
                    status: Some(subscription.status),
                    plan: subscription.plan,
                    current_period_start: subscription.current_period_start,
                    current_period_end: subscription.current_period_end,
                    cancel_at_period_end: Some(subscription.cancel_at_period_end),
                    effective_at: observed_at,
                }
            }
            None => {
                tracing::info!(
                    account_id = %account_id,
                    customer_id = %customer_id,
                    "Processor has no subscription for customer, treating as canceled"
                );
                SubscriptionUpdate {
                    effective_at: observed_at,
                    ..SubscriptionUpdate::canceled()
                }
            }
        };

        let snapshot = apply_subscription_update(&self.stores, account_id, &update).await?;
        self.notifier.subscription_changed(account_id, &snapshot);
        Ok(SyncOutcome {
            snapshot,
            pending: false,
        })
    }

    /// Ask the processor to cancel at period end. Local state is not touched;
    /// the confirmation arrives as a subscription.updated webhook (or the
    /// next sync).
    pub async fn request_cancellation(&self, account_id: Uuid) -> BillingResult<()> {
        let record = self
            .stores
            .subscriptions
            .get(account_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("no subscription for account {}", account_id))
            })?;
        let subscription_id = record.processor_subscription_id.as_deref().ok_or_else(|| {
            BillingError::NotFound(format!(
                "account {} has no processor subscription to cancel",
                account_id
            ))
        })?;

        self.processor
            .set_cancel_at_period_end(subscription_id, true)
            .await?;
        tracing::info!(account_id = %account_id, "Requested cancellation at period end");
        Ok(())
    }

    /// Undo a scheduled cancellation before the period ends
    pub async fn resume(&self, account_id: Uuid) -> BillingResult<()> {
        let record = self
            .stores
            .subscriptions
            .get(account_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("no subscription for account {}", account_id))
            })?;
        let subscription_id = record.processor_subscription_id.as_deref().ok_or_else(|| {
            BillingError::NotFound(format!(
                "account {} has no processor subscription to resume",
                account_id
            ))
        })?;

        self.processor
            .set_cancel_at_period_end(subscription_id, false)
            .await?;
        tracing::info!(account_id = %account_id, "Cancellation unscheduled");
        Ok(())
    }
}
