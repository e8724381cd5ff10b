//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use focusdeck_billing::BillingService;

use crate::{auth::JwtManager, config::Config};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    /// None when processor credentials are missing or billing is disabled;
    /// billing routes answer 503 in that case
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);

        let billing = if config.enable_billing {
            match BillingService::from_env(pool.clone()) {
                Ok(service) => {
                    tracing::info!("Billing service initialized");
                    Some(Arc::new(service))
                }
                Err(e) => {
                    tracing::warn!("Billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        Self {
            pool,
            config,
            jwt_manager,
            billing,
        }
    }

    pub fn billing_service(&self) -> Option<&Arc<BillingService>> {
        self.billing.as_ref()
    }
}
