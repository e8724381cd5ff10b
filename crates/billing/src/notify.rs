//! Outbound change notifications
//!
//! Best-effort webhooks fired at an internal endpoint whenever an account is
//! created or its entitlements change. Delivery is fire-and-forget: failures
//! are logged and never affect the billing operation that triggered them.

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use crate::entitlement::EntitlementSnapshot;
use crate::store::Account;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct NotificationSink {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl NotificationSink {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    /// Reads NOTIFY_WEBHOOK_URL; notifications are off when it is unset.
    pub fn from_env() -> Self {
        let endpoint = std::env::var("NOTIFY_WEBHOOK_URL").ok();
        if endpoint.is_none() {
            tracing::info!("NOTIFY_WEBHOOK_URL not set, change notifications disabled");
        }
        Self::new(endpoint)
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn account_created(&self, account: &Account) {
        self.dispatch(json!({
            "event": "account.created",
            "account_id": account.id,
            "email": account.email,
        }));
    }

    pub fn subscription_changed(&self, account_id: Uuid, snapshot: &EntitlementSnapshot) {
        self.dispatch(json!({
            "event": "subscription.changed",
            "account_id": account_id,
            "plan": snapshot.plan,
            "active": snapshot.active,
        }));
    }

    fn dispatch(&self, payload: serde_json::Value) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            let result = client
                .post(&endpoint)
                .timeout(DISPATCH_TIMEOUT)
                .json(&payload)
                .send()
                .await;
            match result {
                Ok(response) if !response.status().is_success() => {
                    tracing::warn!(
                        status = %response.status(),
                        "Change notification rejected"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to deliver change notification");
                }
                Ok(_) => {}
            }
        });
    }
}
