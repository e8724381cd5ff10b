// Shared crate clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Focusdeck Shared Library
//!
//! Types and helpers shared between the API server and the billing crate:
//! the plan/status vocabulary and database pool lifecycle.

pub mod db;
pub mod types;

pub use db::create_pool;
pub use types::{BillingInterval, Plan, SubscriptionStatus};
