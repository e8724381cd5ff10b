//! Checkout orchestration
//!
//! Validates the request, finds or creates the account, and asks the
//! processor for a hosted checkout session. Deliberately writes nothing to
//! the subscription store: local state only changes when the processor
//! confirms the purchase through a webhook or a sync.

use std::sync::Arc;

use uuid::Uuid;

use focusdeck_shared::{BillingInterval, Plan};

use crate::client::{HostedCheckout, ProcessorClient};
use crate::error::{BillingError, BillingResult};
use crate::notify::NotificationSink;
use crate::store::{Account, Stores};

/// Who is checking out: an authenticated account or a bare email from the
/// public purchase page.
#[derive(Debug, Clone)]
pub enum AccountRef {
    Id(Uuid),
    Email(String),
}

#[derive(Clone)]
pub struct CheckoutService {
    processor: Arc<dyn ProcessorClient>,
    stores: Stores,
    notifier: NotificationSink,
}

impl CheckoutService {
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

    pub async fn create_checkout(
        &self,
        account: AccountRef,
        plan: Plan,
        interval: BillingInterval,
    ) -> BillingResult<HostedCheckout> {
        if !plan.is_paid() {
            return Err(BillingError::Validation(
                "the free plan cannot be purchased".into(),
            ));
        }

        let account = self.resolve_account(account).await?;

        let checkout = self
            .processor
            .create_checkout_session(account.id, &account.email, plan, interval)
            .await?;

        tracing::info!(
            account_id = %account.id,
            plan = %plan,
            session_id = %checkout.session_id,
            "Checkout session ready"
        );
        Ok(checkout)
    }

    async fn resolve_account(&self, account: AccountRef) -> BillingResult<Account> {
        match account {
            AccountRef::Id(id) => self
                .stores
                .accounts
                .get(id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("account {}", id))),
            AccountRef::Email(email) => {
                validate_email(&email)?;
                let (account, created) =
                    self.stores.accounts.find_or_create(&email, None).await?;
                if created {
                    tracing::info!(account_id = %account.id, "Created account during checkout");
                    self.notifier.account_created(&account);
                }
                Ok(account)
            }
        }
    }
}

/// Structural email check: one '@', non-empty local part, domain with a dot.
/// Deliverability is the processor's problem.
fn validate_email(email: &str) -> BillingResult<()> {
    let email = email.trim();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(BillingError::Validation(format!(
            "invalid email address: {}",
            email
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ProcessorSubscription;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProcessor {
        calls: AtomicUsize,
    }

    impl FakeProcessor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProcessorClient for FakeProcessor {
        async fn create_checkout_session(
            &self,
            account_id: Uuid,
            _email: &str,
            plan: Plan,
            _interval: BillingInterval,
        ) -> BillingResult<HostedCheckout> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HostedCheckout {
                session_id: format!("cs_{}_{}", account_id.simple(), plan),
                redirect_url: "https://checkout.example.com/cs_test".into(),
            })
        }

        async fn latest_subscription(
            &self,
            _customer_id: &str,
        ) -> BillingResult<Option<ProcessorSubscription>> {
            Ok(None)
        }

        async fn set_cancel_at_period_end(
            &self,
            _subscription_id: &str,
            _cancel: bool,
        ) -> BillingResult<()> {
            Ok(())
        }
    }

    fn service(processor: Arc<FakeProcessor>, stores: Stores) -> CheckoutService {
        CheckoutService::new(processor, stores, NotificationSink::disabled())
    }

    #[test]
    fn test_email_validation() {
        assert!(validate_email("user@example.com").is_ok());
        assert!(validate_email("  user@example.com ").is_ok());
        assert!(validate_email("user+tag@sub.example.co").is_ok());
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("user@nodot").is_err());
        assert!(validate_email("user@.example.com").is_err());
        assert!(validate_email("user name@example.com").is_err());
    }

    #[tokio::test]
    async fn test_free_plan_is_rejected_before_any_lookup() {
        let processor = FakeProcessor::new();
        let service = service(processor.clone(), Stores::in_memory());
        let err = service
            .create_checkout(
                AccountRef::Email("user@example.com".into()),
                Plan::Free,
                BillingInterval::Monthly,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_account_id_is_not_found() {
        let processor = FakeProcessor::new();
        let service = service(processor, Stores::in_memory());
        let err = service
            .create_checkout(
                AccountRef::Id(Uuid::new_v4()),
                Plan::Pro,
                BillingInterval::Monthly,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_public_checkout_creates_account_once() {
        let processor = FakeProcessor::new();
        let stores = Stores::in_memory();
        let service = service(processor.clone(), stores.clone());

        for _ in 0..2 {
            service
                .create_checkout(
                    AccountRef::Email("Buyer@Example.com".into()),
                    Plan::Pro,
                    BillingInterval::Yearly,
                )
                .await
                .unwrap();
        }

        let account = stores
            .accounts
            .find_by_email("buyer@example.com")
            .await
            .unwrap()
            .unwrap();
        // Checkout never writes subscription state
        assert!(stores.subscriptions.get(account.id).await.unwrap().is_none());
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
    }
}
