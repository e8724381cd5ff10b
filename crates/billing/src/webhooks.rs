//! Webhook ingestion
//!
//! Verify the delivery signature, claim the event id so replays and
//! concurrent deliveries are no-ops, apply the state transition, then mark
//! the event processed. A failed application releases the claim so the
//! processor's redelivery gets a fresh attempt.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use focusdeck_shared::{Plan, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};
use crate::events::{EventKind, ProcessorEvent};
use crate::notify::NotificationSink;
use crate::store::{ClaimOutcome, Stores};
use crate::transition::{apply_subscription_update, SubscriptionUpdate};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery before it is rejected as a replay
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Check a `t=...,v1=...` signature header against the shared secret.
///
/// The signed message is `"{timestamp}.{payload}"` and the signature is its
/// hex-encoded HMAC-SHA256. Any v1 candidate matching within the timestamp
/// tolerance passes.
pub fn verify_signature(
    secret: &str,
    payload: &str,
    signature_header: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::SignatureInvalid)?;
    if candidates.is_empty() {
        return Err(BillingError::SignatureInvalid);
    }
    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(BillingError::SignatureInvalid);
    }

    // Secrets are distributed with a "whsec_" prefix that is not part of the key
    let key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| BillingError::Internal("webhook secret unusable as HMAC key".into()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    if candidates.iter().any(|candidate| *candidate == expected) {
        Ok(())
    } else {
        Err(BillingError::SignatureInvalid)
    }
}

pub struct WebhookHandler {
    secret: Option<String>,
    stores: Stores,
    notifier: NotificationSink,
}

impl WebhookHandler {
    pub fn new(secret: Option<String>, stores: Stores, notifier: NotificationSink) -> Self {
        Self {
            secret,
            stores,
            notifier,
        }
    }

    /// Ingest one webhook delivery: verify, dedup, apply.
    ///
    /// Returns Ok both for newly applied events and for duplicates of already
    /// processed ones; the caller acknowledges either way.
    pub async fn ingest(&self, payload: &str, signature_header: Option<&str>) -> BillingResult<()> {
        match self.secret.as_deref() {
            Some(secret) => {
                let signature_header = signature_header.ok_or(BillingError::SignatureInvalid)?;
                verify_signature(
                    secret,
                    payload,
                    signature_header,
                    OffsetDateTime::now_utc().unix_timestamp(),
                )?;
            }
            // Local-development mode only; a deployed instance must configure
            // the secret.
            None => {
                tracing::warn!("No webhook secret configured, accepting delivery unverified");
            }
        }

        let event = ProcessorEvent::from_payload(payload)?;
        let kind = event.kind();

        match self.stores.webhook_events.try_claim(&event.id).await? {
            ClaimOutcome::AlreadyProcessed => {
                tracing::info!(event_id = %event.id, "Duplicate webhook delivery, skipping");
                return Ok(());
            }
            ClaimOutcome::InFlight => {
                tracing::info!(event_id = %event.id, "Webhook event already being processed");
                return Err(BillingError::WriteConflict(format!(
                    "event {} is being processed by another delivery",
                    event.id
                )));
            }
            ClaimOutcome::Claimed => {}
        }

        match self.apply(&event, kind).await {
            Ok(()) => {
                self.stores.webhook_events.mark_processed(&event.id).await?;
                Ok(())
            }
            Err(e) => {
                // Give the claim back so the processor's retry can reapply
                if let Err(release_err) = self.stores.webhook_events.release(&event.id).await {
                    tracing::error!(
                        event_id = %event.id,
                        error = %release_err,
                        "Failed to release webhook claim after error"
                    );
                }
                Err(e)
            }
        }
    }

    async fn apply(&self, event: &ProcessorEvent, kind: EventKind) -> BillingResult<()> {
        tracing::info!(event_id = %event.id, event_type = %event.event_type, "Processing webhook event");
        match kind {
            EventKind::CheckoutCompleted => self.on_checkout_completed(event).await,
            EventKind::SubscriptionUpdated => self.on_subscription_updated(event).await,
            EventKind::SubscriptionDeleted => self.on_subscription_deleted(event).await,
            EventKind::InvoicePaymentFailed => self.on_invoice_payment_failed(event).await,
            // Payment success carries no state we don't already learn from
            // subscription events; recording the event id is enough.
            EventKind::InvoicePaymentSucceeded => Ok(()),
            EventKind::Unknown => {
                tracing::info!(event_type = %event.event_type, "Ignoring unhandled webhook event type");
                Ok(())
            }
        }
    }

    async fn on_checkout_completed(&self, event: &ProcessorEvent) -> BillingResult<()> {
        let session = event.checkout_session()?;
        let account_id = account_id_from_metadata(&session.metadata).ok_or_else(|| {
            BillingError::Validation(format!(
                "checkout session {} has no account_id metadata",
                session.id
            ))
        })?;

        let plan = session
            .metadata
            .get("plan")
            .and_then(|p| p.parse::<Plan>().ok());
        if plan.is_none() {
            tracing::warn!(
                session_id = %session.id,
                "Checkout session metadata has no usable plan, retaining current"
            );
        }

        let update = SubscriptionUpdate {
            processor_subscription_id: session.subscription.clone(),
            processor_customer_id: session.customer.clone(),
            status: Some(SubscriptionStatus::Active),
            plan,
            current_period_start: session.period_start(),
            current_period_end: session.period_end(),
            cancel_at_period_end: Some(false),
            effective_at: event.occurred_at(),
        };
        let snapshot = apply_subscription_update(&self.stores, account_id, &update).await?;
        self.notifier.subscription_changed(account_id, &snapshot);
        Ok(())
    }

    async fn on_subscription_updated(&self, event: &ProcessorEvent) -> BillingResult<()> {
        let subscription = event.subscription()?;
        let account_id = self
            .resolve_account(&subscription.metadata, subscription.customer.as_deref())
            .await?;

        let status = match subscription.status.as_deref() {
            Some(raw) => SubscriptionStatus::from_processor(raw).unwrap_or_else(|| {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    status = raw,
                    "Unknown subscription status, treating as incomplete"
                );
                SubscriptionStatus::Incomplete
            }),
            None => {
                return Err(BillingError::Validation(format!(
                    "subscription {} event has no status",
                    subscription.id
                )))
            }
        };

        let update = SubscriptionUpdate {
            processor_subscription_id: Some(subscription.id.clone()),
            processor_customer_id: subscription.customer.clone(),
            status: Some(status),
            plan: subscription
                .metadata
                .get("plan")
                .and_then(|p| p.parse::<Plan>().ok()),
            current_period_start: subscription.period_start(),
            current_period_end: subscription.period_end(),
            cancel_at_period_end: subscription.cancel_at_period_end,
            effective_at: event.occurred_at(),
        };
        let snapshot = apply_subscription_update(&self.stores, account_id, &update).await?;
        self.notifier.subscription_changed(account_id, &snapshot);
        Ok(())
    }

    async fn on_subscription_deleted(&self, event: &ProcessorEvent) -> BillingResult<()> {
        let subscription = event.subscription()?;
        let account_id = self
            .resolve_account(&subscription.metadata, subscription.customer.as_deref())
            .await?;

        let update = SubscriptionUpdate {
            effective_at: event.occurred_at(),
            ..SubscriptionUpdate::canceled()
        };
        let snapshot = apply_subscription_update(&self.stores, account_id, &update).await?;
        self.notifier.subscription_changed(account_id, &snapshot);
        Ok(())
    }

    async fn on_invoice_payment_failed(&self, event: &ProcessorEvent) -> BillingResult<()> {
        let invoice = event.invoice()?;
        // Invoices carry no session metadata; the customer id is the only link
        let customer_id = invoice.customer.as_deref().ok_or_else(|| {
            BillingError::Validation(format!("invoice {} has no customer", invoice.id))
        })?;
        let account_id = self
            .stores
            .subscriptions
            .account_for_customer(customer_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("no account for customer {}", customer_id))
            })?;

        tracing::warn!(account_id = %account_id, "Invoice payment failed, starting grace period");
        let update = SubscriptionUpdate {
            effective_at: event.occurred_at(),
            ..SubscriptionUpdate::payment_failed()
        };
        let snapshot = apply_subscription_update(&self.stores, account_id, &update).await?;
        self.notifier.subscription_changed(account_id, &snapshot);
        Ok(())
    }

    /// Attribute an event to an account: metadata first, then the customer id
    /// recorded from a previous event.
    async fn resolve_account(
        &self,
        metadata: &std::collections::HashMap<String, String>,
        customer_id: Option<&str>,
    ) -> BillingResult<Uuid> {
        if let Some(account_id) = account_id_from_metadata(metadata) {
            return Ok(account_id);
        }
        if let Some(customer_id) = customer_id {
            if let Some(account_id) = self
                .stores
                .subscriptions
                .account_for_customer(customer_id)
                .await?
            {
                return Ok(account_id);
            }
        }
        Err(BillingError::NotFound(
            "event is not attributable to any account".into(),
        ))
    }
}

fn account_id_from_metadata(
    metadata: &std::collections::HashMap<String, String>,
) -> Option<Uuid> {
    metadata.get("account_id").and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(b"test_secret").unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    #[test]
    fn test_valid_signature_passes() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, 1_700_000_000);
        assert!(verify_signature(SECRET, payload, &header, 1_700_000_000).is_ok());
        // Within tolerance
        assert!(verify_signature(SECRET, payload, &header, 1_700_000_000 + 299).is_ok());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, 1_700_000_000);
        let err = verify_signature(SECRET, payload, &header, 1_700_000_000 + 301).unwrap_err();
        assert!(matches!(err, BillingError::SignatureInvalid));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign(r#"{"id":"evt_1"}"#, 1_700_000_000);
        let err =
            verify_signature(SECRET, r#"{"id":"evt_2"}"#, &header, 1_700_000_000).unwrap_err();
        assert!(matches!(err, BillingError::SignatureInvalid));
    }

    #[test]
    fn test_malformed_header_rejected() {
        for header in ["", "v1=abc", "t=notanumber,v1=abc", "t=1700000000"] {
            assert!(verify_signature(SECRET, "{}", header, 1_700_000_000).is_err());
        }
    }

    #[test]
    fn test_secret_prefix_is_optional() {
        let payload = "{}";
        let header = sign(payload, 1_700_000_000);
        assert!(verify_signature("test_secret", payload, &header, 1_700_000_000).is_ok());
    }
}
