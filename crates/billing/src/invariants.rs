//! Billing invariant checks
//!
//! Runnable consistency checks over an account's billing state, usable after
//! webhook replays or manual data surgery. Checks only read, never write, and
//! each violation carries enough context to debug from the report alone.

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::resolve;
use crate::error::{BillingError, BillingResult};
use crate::store::Stores;

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationSeverity {
    /// Entitlements may be wrong right now
    Critical,
    /// Inconsistent bookkeeping, access unaffected
    Warning,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::Warning => write!(f, "WARNING"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub account_id: Uuid,
    pub description: String,
    pub severity: ViolationSeverity,
}

/// Report for one account
#[derive(Debug, Clone, Serialize)]
pub struct InvariantReport {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub account_id: Uuid,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

pub struct InvariantChecker {
    stores: Stores,
}

impl InvariantChecker {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn check_account(&self, account_id: Uuid) -> BillingResult<InvariantReport> {
        let account = self
            .stores
            .accounts
            .get(account_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("account {}", account_id)))?;
        let record = self.stores.subscriptions.get(account_id).await?;

        let mut violations = Vec::new();

        // The cached plan must match what the record resolves to
        let resolved = resolve(record.as_ref());
        if account.cached_plan != resolved.plan {
            violations.push(InvariantViolation {
                invariant: "cached_plan_matches_resolution".into(),
                account_id,
                description: format!(
                    "cached plan is {} but the subscription record resolves to {}",
                    account.cached_plan, resolved.plan
                ),
                severity: ViolationSeverity::Critical,
            });
        }

        if let Some(record) = &record {
            if record.version < 1 {
                violations.push(InvariantViolation {
                    invariant: "version_is_positive".into(),
                    account_id,
                    description: format!("subscription record has version {}", record.version),
                    severity: ViolationSeverity::Warning,
                });
            }

            // A linked subscription without its customer cannot be reconciled
            if record.processor_subscription_id.is_some()
                && record.processor_customer_id.is_none()
            {
                violations.push(InvariantViolation {
                    invariant: "linked_subscription_has_customer".into(),
                    account_id,
                    description: "record has a processor subscription id but no customer id"
                        .into(),
                    severity: ViolationSeverity::Warning,
                });
            }

            if let (Some(start), Some(end)) =
                (record.current_period_start, record.current_period_end)
            {
                if end <= start {
                    violations.push(InvariantViolation {
                        invariant: "period_is_ordered".into(),
                        account_id,
                        description: format!(
                            "current period ends at {} before it starts at {}",
                            end, start
                        ),
                        severity: ViolationSeverity::Warning,
                    });
                }
            }
        }

        let healthy = violations.is_empty();
        if !healthy {
            tracing::warn!(
                account_id = %account_id,
                violations = violations.len(),
                "Billing invariant violations found"
            );
        }

        Ok(InvariantReport {
            checked_at: OffsetDateTime::now_utc(),
            account_id,
            violations,
            healthy,
        })
    }
}
