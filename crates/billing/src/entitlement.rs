//! Entitlement resolution
//!
//! Pure mapping from a subscription record to what the account can do.
//! Resolution never touches the processor and has no side effects; the
//! service wrapper only adds the store read.

use serde::Serialize;
use uuid::Uuid;

use focusdeck_shared::{Plan, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};
use crate::store::{Stores, SubscriptionRecord};

/// Feature limits and flags granted by a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanFeatures {
    pub max_documents: u32,
    pub max_storage_mb: u64,
    pub advanced_analytics: bool,
    pub priority_support: bool,
    pub custom_branding: bool,
    pub api_access: bool,
    pub team_collaboration: bool,
}

impl PlanFeatures {
    /// The feature table. u32::MAX / u64::MAX mean unlimited.
    pub fn for_plan(plan: Plan) -> Self {
        match plan {
            Plan::Free => Self {
                max_documents: 25,
                max_storage_mb: 512,
                advanced_analytics: false,
                priority_support: false,
                custom_branding: false,
                api_access: false,
                team_collaboration: false,
            },
            Plan::Pro => Self {
                max_documents: 1_000,
                max_storage_mb: 10_240,
                advanced_analytics: true,
                priority_support: false,
                custom_branding: true,
                api_access: true,
                team_collaboration: false,
            },
            Plan::Enterprise => Self {
                max_documents: u32::MAX,
                max_storage_mb: u64::MAX,
                advanced_analytics: true,
                priority_support: true,
                custom_branding: true,
                api_access: true,
                team_collaboration: true,
            },
        }
    }
}

/// What an account is currently entitled to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntitlementSnapshot {
    pub plan: Plan,
    pub active: bool,
    pub features: PlanFeatures,
}

impl EntitlementSnapshot {
    pub fn free() -> Self {
        Self {
            plan: Plan::Free,
            active: false,
            features: PlanFeatures::for_plan(Plan::Free),
        }
    }
}

/// Resolve entitlements from the local subscription record.
///
/// No record, or a canceled/incomplete one, resolves to free. A past-due
/// record keeps its plan as a grace period but is not active, so access
/// checks fail while the plan label survives a recovered payment.
pub fn resolve(record: Option<&SubscriptionRecord>) -> EntitlementSnapshot {
    let Some(record) = record else {
        return EntitlementSnapshot::free();
    };
    let plan = match record.status {
        SubscriptionStatus::Canceled | SubscriptionStatus::Incomplete => Plan::Free,
        SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue => {
            record.plan
        }
    };
    EntitlementSnapshot {
        plan,
        active: record.status.grants_access(),
        features: PlanFeatures::for_plan(plan),
    }
}

/// Read path for entitlements: load the record and resolve it
#[derive(Clone)]
pub struct EntitlementService {
    stores: Stores,
}

impl EntitlementService {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn current(&self, account_id: Uuid) -> BillingResult<EntitlementSnapshot> {
        if self.stores.accounts.get(account_id).await?.is_none() {
            return Err(BillingError::NotFound(format!("account {}", account_id)));
        }
        let record = self.stores.subscriptions.get(account_id).await?;
        Ok(resolve(record.as_ref()))
    }
}
