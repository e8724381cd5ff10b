//! Payment processor client
//!
//! [`ProcessorClient`] is the seam between the engine and Stripe: checkout
//! session creation, subscription lookup, and cancellation scheduling. The
//! live implementation wraps the async-stripe client with a hard per-request
//! deadline; tests substitute fakes.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use stripe::{
    CheckoutSession, CheckoutSessionMode, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData, CustomerId,
    ListSubscriptions, Subscription, SubscriptionId, UpdateSubscription,
};

use focusdeck_shared::{BillingInterval, Plan, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Price ids for each purchasable plan and interval combination
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub pro_monthly: Option<String>,
    pub pro_yearly: Option<String>,
    pub enterprise_monthly: Option<String>,
    pub enterprise_yearly: Option<String>,
}

#[derive(Clone)]
pub struct ProcessorConfig {
    pub secret_key: String,
    pub webhook_secret: Option<String>,
    pub app_base_url: String,
    pub price_ids: PriceIds,
    pub request_timeout: Duration,
}

impl ProcessorConfig {
    /// Load from environment. Missing STRIPE_SECRET_KEY means the deployment
    /// runs without billing; callers decide whether that is fatal.
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::NotConfigured("STRIPE_SECRET_KEY not set".into()))?;

        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").ok();
        if webhook_secret.is_none() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set, webhook signatures will not be verified");
        }

        let app_base_url = std::env::var("APP_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());

        Ok(Self {
            secret_key,
            webhook_secret,
            app_base_url,
            price_ids: PriceIds {
                pro_monthly: std::env::var("STRIPE_PRICE_PRO_MONTHLY").ok(),
                pro_yearly: std::env::var("STRIPE_PRICE_PRO_YEARLY").ok(),
                enterprise_monthly: std::env::var("STRIPE_PRICE_ENTERPRISE_MONTHLY").ok(),
                enterprise_yearly: std::env::var("STRIPE_PRICE_ENTERPRISE_YEARLY").ok(),
            },
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn price_id(&self, plan: Plan, interval: BillingInterval) -> Option<&str> {
        let id = match (plan, interval) {
            (Plan::Pro, BillingInterval::Monthly) => &self.price_ids.pro_monthly,
            (Plan::Pro, BillingInterval::Yearly) => &self.price_ids.pro_yearly,
            (Plan::Enterprise, BillingInterval::Monthly) => &self.price_ids.enterprise_monthly,
            (Plan::Enterprise, BillingInterval::Yearly) => &self.price_ids.enterprise_yearly,
            (Plan::Free, _) => &None,
        };
        id.as_deref()
    }

    /// Reverse map from a processor price id to the plan it sells
    pub fn plan_for_price(&self, price_id: &str) -> Option<Plan> {
        let matches = |candidate: &Option<String>| candidate.as_deref() == Some(price_id);
        if matches(&self.price_ids.pro_monthly) || matches(&self.price_ids.pro_yearly) {
            Some(Plan::Pro)
        } else if matches(&self.price_ids.enterprise_monthly)
            || matches(&self.price_ids.enterprise_yearly)
        {
            Some(Plan::Enterprise)
        } else {
            None
        }
    }
}

/// A checkout session hosted by the processor
#[derive(Debug, Clone)]
pub struct HostedCheckout {
    pub session_id: String,
    pub redirect_url: String,
}

/// Processor-side view of a subscription, already folded into our vocabulary
#[derive(Debug, Clone)]
pub struct ProcessorSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub plan: Option<Plan>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

#[async_trait]
pub trait ProcessorClient: Send + Sync {
    /// Create a hosted checkout session for a paid plan. The account id rides
    /// along as metadata on both the session and the resulting subscription
    /// so webhook events can be attributed.
    async fn create_checkout_session(
        &self,
        account_id: Uuid,
        email: &str,
        plan: Plan,
        interval: BillingInterval,
    ) -> BillingResult<HostedCheckout>;

    /// The customer's most recently created subscription, if any
    async fn latest_subscription(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<ProcessorSubscription>>;

    /// Schedule or unschedule cancellation at the end of the current period
    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<()>;
}

pub struct StripeProcessor {
    client: Client,
    config: ProcessorConfig,
}

impl StripeProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            client: Client::new(config.secret_key.clone()),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(ProcessorConfig::from_env()?))
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Bound every outbound call so a stalled processor surfaces as a
    /// retryable error instead of a hung request.
    async fn with_deadline<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T, stripe::StripeError>>,
    ) -> BillingResult<T> {
        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::error!(operation, error = %e, "Processor request failed");
                Err(BillingError::ProcessorUnavailable(e.to_string()))
            }
            Err(_) => {
                tracing::error!(operation, "Processor request timed out");
                Err(BillingError::ProcessorUnavailable(format!(
                    "{} timed out",
                    operation
                )))
            }
        }
    }
}

fn fold_status(status: stripe::SubscriptionStatus) -> SubscriptionStatus {
    use stripe::SubscriptionStatus as S;
    match status {
        S::Active => SubscriptionStatus::Active,
        S::Trialing => SubscriptionStatus::Trialing,
        S::PastDue | S::Unpaid => SubscriptionStatus::PastDue,
        S::Canceled => SubscriptionStatus::Canceled,
        S::Incomplete | S::IncompleteExpired | S::Paused => SubscriptionStatus::Incomplete,
    }
}

fn customer_id_of(subscription: &Subscription) -> String {
    match &subscription.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(customer) => customer.id.to_string(),
    }
}

#[async_trait]
impl ProcessorClient for StripeProcessor {
    async fn create_checkout_session(
        &self,
        account_id: Uuid,
        email: &str,
        plan: Plan,
        interval: BillingInterval,
    ) -> BillingResult<HostedCheckout> {
        let price_id = self.config.price_id(plan, interval).ok_or_else(|| {
            BillingError::NotConfigured(format!("no price configured for {} {}", plan, interval))
        })?;

        let success_url = format!(
            "{}/billing?checkout=success&session_id={{CHECKOUT_SESSION_ID}}",
            self.config.app_base_url
        );
        let cancel_url = format!("{}/billing?checkout=cancelled", self.config.app_base_url);

        let reference = account_id.to_string();
        let mut metadata = HashMap::new();
        metadata.insert("account_id".to_string(), account_id.to_string());
        metadata.insert("plan".to_string(), plan.to_string());
        metadata.insert("billing_interval".to_string(), interval.to_string());

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.customer_email = Some(email);
        params.client_reference_id = Some(&reference);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        // Metadata on the subscription itself, not just the session, so
        // subscription lifecycle events carry the account id.
        params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata.clone()),
            ..Default::default()
        });
        params.metadata = Some(metadata);

        let session = self
            .with_deadline("create_checkout_session", CheckoutSession::create(&self.client, params))
            .await?;

        let redirect_url = session.url.ok_or_else(|| {
            BillingError::ProcessorUnavailable("checkout session has no redirect URL".into())
        })?;

        tracing::info!(
            account_id = %account_id,
            plan = %plan,
            interval = %interval,
            session_id = %session.id,
            "Created checkout session"
        );

        Ok(HostedCheckout {
            session_id: session.id.to_string(),
            redirect_url,
        })
    }

    async fn latest_subscription(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<ProcessorSubscription>> {
        let customer: CustomerId = customer_id
            .parse()
            .map_err(|_| BillingError::Validation(format!("invalid customer id: {}", customer_id)))?;

        let params = ListSubscriptions {
            customer: Some(customer),
            ..Default::default()
        };
        let subscriptions = self
            .with_deadline("list_subscriptions", Subscription::list(&self.client, &params))
            .await?;

        let Some(newest) = subscriptions.data.into_iter().max_by_key(|s| s.created) else {
            return Ok(None);
        };

        let plan = newest
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .and_then(|price| self.config.plan_for_price(price.id.as_str()))
            .or_else(|| {
                newest
                    .metadata
                    .get("plan")
                    .and_then(|p| p.parse::<Plan>().ok())
            });

        Ok(Some(ProcessorSubscription {
            id: newest.id.to_string(),
            customer_id: customer_id_of(&newest),
            status: fold_status(newest.status),
            plan,
            current_period_start: OffsetDateTime::from_unix_timestamp(newest.current_period_start)
                .ok(),
            current_period_end: OffsetDateTime::from_unix_timestamp(newest.current_period_end)
                .ok(),
            cancel_at_period_end: newest.cancel_at_period_end,
        }))
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<()> {
        let id: SubscriptionId = subscription_id.parse().map_err(|_| {
            BillingError::Validation(format!("invalid subscription id: {}", subscription_id))
        })?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel),
            ..Default::default()
        };
        self.with_deadline(
            "update_subscription",
            Subscription::update(&self.client, &id, params),
        )
        .await?;

        tracing::info!(
            subscription_id,
            cancel_at_period_end = cancel,
            "Updated subscription cancellation"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_prices() -> ProcessorConfig {
        ProcessorConfig {
            secret_key: "sk_test_x".into(),
            webhook_secret: None,
            app_base_url: "http://localhost:3000".into(),
            price_ids: PriceIds {
                pro_monthly: Some("price_pro_m".into()),
                pro_yearly: Some("price_pro_y".into()),
                enterprise_monthly: Some("price_ent_m".into()),
                enterprise_yearly: None,
            },
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[test]
    fn test_price_lookup() {
        let config = config_with_prices();
        assert_eq!(
            config.price_id(Plan::Pro, BillingInterval::Monthly),
            Some("price_pro_m")
        );
        assert_eq!(config.price_id(Plan::Enterprise, BillingInterval::Yearly), None);
        assert_eq!(config.price_id(Plan::Free, BillingInterval::Monthly), None);
    }

    #[test]
    fn test_plan_for_price_reverse_mapping() {
        let config = config_with_prices();
        assert_eq!(config.plan_for_price("price_pro_y"), Some(Plan::Pro));
        assert_eq!(config.plan_for_price("price_ent_m"), Some(Plan::Enterprise));
        assert_eq!(config.plan_for_price("price_unknown"), None);
    }

    #[test]
    fn test_status_folding_covers_processor_statuses() {
        assert_eq!(
            fold_status(stripe::SubscriptionStatus::Unpaid),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            fold_status(stripe::SubscriptionStatus::Paused),
            SubscriptionStatus::Incomplete
        );
        assert_eq!(
            fold_status(stripe::SubscriptionStatus::Trialing),
            SubscriptionStatus::Trialing
        );
    }
}
