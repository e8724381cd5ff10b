//! Processor webhook wire types
//!
//! Deserialized leniently: unknown fields are ignored and referenced objects
//! may arrive either as a bare id string or an expanded object, so payload
//! shape drift on the processor side does not break ingestion.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// The event categories the engine reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutCompleted,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentFailed,
    InvoicePaymentSucceeded,
    Unknown,
}

impl EventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => Self::CheckoutCompleted,
            "customer.subscription.created" | "customer.subscription.updated" => {
                Self::SubscriptionUpdated
            }
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "invoice.paid" | "invoice.payment_succeeded" => Self::InvoicePaymentSucceeded,
            _ => Self::Unknown,
        }
    }
}

/// Envelope common to every webhook delivery
#[derive(Debug, Deserialize)]
pub struct ProcessorEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds the processor created the event; orders reordered
    /// deliveries
    #[serde(default)]
    pub created: Option<i64>,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub object: Value,
}

impl ProcessorEvent {
    pub fn from_payload(payload: &str) -> BillingResult<Self> {
        let event: Self = serde_json::from_str(payload)
            .map_err(|e| BillingError::Validation(format!("malformed event payload: {}", e)))?;
        if event.id.is_empty() {
            return Err(BillingError::Validation("event id is empty".into()));
        }
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }

    pub fn occurred_at(&self) -> Option<OffsetDateTime> {
        unix_timestamp(self.created)
    }

    fn object<T: for<'de> Deserialize<'de>>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| BillingError::Validation(format!("malformed event object: {}", e)))
    }

    pub fn checkout_session(&self) -> BillingResult<CheckoutSessionPayload> {
        self.object()
    }

    pub fn subscription(&self) -> BillingResult<SubscriptionPayload> {
        self.object()
    }

    pub fn invoice(&self) -> BillingResult<InvoicePayload> {
        self.object()
    }
}

/// Accepts "cus_123", {"id": "cus_123", ...}, or null
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(id)) => Some(id),
        Some(Value::Object(map)) => map
            .get("id")
            .and_then(Value::as_str)
            .map(String::from),
        _ => None,
    })
}

fn unix_timestamp(seconds: Option<i64>) -> Option<OffsetDateTime> {
    seconds.and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CheckoutSessionPayload {
    pub id: String,
    #[serde(deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    pub metadata: HashMap<String, String>,
    // Rarely present on sessions; the subscription events are the usual source
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
}

impl CheckoutSessionPayload {
    pub fn period_start(&self) -> Option<OffsetDateTime> {
        unix_timestamp(self.current_period_start)
    }

    pub fn period_end(&self) -> Option<OffsetDateTime> {
        unix_timestamp(self.current_period_end)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SubscriptionPayload {
    pub id: String,
    #[serde(deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    pub status: Option<String>,
    pub cancel_at_period_end: Option<bool>,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    pub metadata: HashMap<String, String>,
}

impl SubscriptionPayload {
    pub fn period_start(&self) -> Option<OffsetDateTime> {
        unix_timestamp(self.current_period_start)
    }

    pub fn period_end(&self) -> Option<OffsetDateTime> {
        unix_timestamp(self.current_period_end)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InvoicePayload {
    pub id: String,
    #[serde(deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            EventKind::parse("checkout.session.completed"),
            EventKind::CheckoutCompleted
        );
        assert_eq!(
            EventKind::parse("customer.subscription.created"),
            EventKind::SubscriptionUpdated
        );
        assert_eq!(
            EventKind::parse("customer.subscription.deleted"),
            EventKind::SubscriptionDeleted
        );
        assert_eq!(
            EventKind::parse("invoice.payment_failed"),
            EventKind::InvoicePaymentFailed
        );
        assert_eq!(EventKind::parse("charge.refunded"), EventKind::Unknown);
    }

    #[test]
    fn test_envelope_rejects_missing_id() {
        let err = ProcessorEvent::from_payload(
            r#"{"id": "", "type": "invoice.paid", "data": {"object": {}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        assert!(ProcessorEvent::from_payload("not json").is_err());
    }

    #[test]
    fn test_expandable_customer_accepts_string_and_object() {
        let bare: SubscriptionPayload =
            serde_json::from_str(r#"{"id": "sub_1", "customer": "cus_9"}"#).unwrap();
        assert_eq!(bare.customer.as_deref(), Some("cus_9"));

        let expanded: SubscriptionPayload =
            serde_json::from_str(r#"{"id": "sub_1", "customer": {"id": "cus_9", "email": "x@y.z"}}"#)
                .unwrap();
        assert_eq!(expanded.customer.as_deref(), Some("cus_9"));

        let absent: SubscriptionPayload = serde_json::from_str(r#"{"id": "sub_1"}"#).unwrap();
        assert_eq!(absent.customer, None);
    }

    #[test]
    fn test_subscription_payload_periods() {
        let payload: SubscriptionPayload = serde_json::from_str(
            r#"{"id": "sub_1", "current_period_start": 1700000000, "current_period_end": 1702592000}"#,
        )
        .unwrap();
        assert_eq!(
            payload.period_start().map(|t| t.unix_timestamp()),
            Some(1700000000)
        );
        assert!(payload.period_end().is_some());
    }

    #[test]
    fn test_envelope_created_is_optional() {
        let dated = ProcessorEvent::from_payload(
            r#"{"id": "evt_1", "type": "invoice.paid", "created": 1700000000, "data": {"object": {}}}"#,
        )
        .unwrap();
        assert_eq!(
            dated.occurred_at().map(|t| t.unix_timestamp()),
            Some(1700000000)
        );

        let undated = ProcessorEvent::from_payload(
            r#"{"id": "evt_1", "type": "invoice.paid", "data": {"object": {}}}"#,
        )
        .unwrap();
        assert_eq!(undated.occurred_at(), None);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let event = ProcessorEvent::from_payload(
            r#"{
                "id": "evt_1",
                "type": "checkout.session.completed",
                "api_version": "2024-06-20",
                "livemode": false,
                "data": {"object": {"id": "cs_1", "metadata": {"account_id": "abc"}, "payment_status": "paid"}}
            }"#,
        )
        .unwrap();
        assert_eq!(event.kind(), EventKind::CheckoutCompleted);
        let session = event.checkout_session().unwrap();
        assert_eq!(session.metadata.get("account_id").map(String::as_str), Some("abc"));
    }
}
