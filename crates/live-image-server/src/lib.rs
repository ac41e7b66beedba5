//! Standalone live image server wiring

use color_eyre::eyre::{self, WrapErr};
use live_image_common::PolicyEnforcer;
use live_image_gateway::{
    build_router, ApiServerConfig, AppState, InMemoryCompute, Inventory, LiveImageController,
    RulePolicy,
};
use live_image_quota::{InMemoryQuotaStorage, ProjectLimits, QuotaEnforcer};
use std::sync::Arc;
use tracing::info;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info,live_image_gateway=debug";

/// Policy rules from the configured file layered over the built-in defaults.
pub async fn load_policy(config: &ApiServerConfig) -> eyre::Result<RulePolicy> {
    match &config.policy_file {
        Some(path) => {
            let policy = RulePolicy::from_file(path)
                .await
                .wrap_err_with(|| format!("loading policy file {}", path.display()))?
                .merged_with_defaults();
            info!("Loaded {} policy rules from {}", policy.len(), path.display());
            Ok(policy)
        }
        None => Ok(RulePolicy::with_defaults()),
    }
}

pub async fn build_compute(
    config: &ApiServerConfig,
    policy: Arc<dyn PolicyEnforcer>,
) -> eyre::Result<Arc<InMemoryCompute>> {
    let compute = match &config.inventory_file {
        Some(path) => {
            let inventory = Inventory::from_file(path)
                .await
                .wrap_err_with(|| format!("loading inventory file {}", path.display()))?;
            InMemoryCompute::with_inventory(policy, inventory).await
        }
        None => InMemoryCompute::new(policy),
    };

    info!("Compute inventory: {} instances", compute.instance_count().await);
    Ok(Arc::new(compute))
}

/// Assemble the application state from configuration.
pub async fn build_state(config: ApiServerConfig) -> eyre::Result<Arc<AppState>> {
    let policy: Arc<dyn PolicyEnforcer> = Arc::new(load_policy(&config).await?);
    let compute = build_compute(&config, policy.clone()).await?;
    let quota = Arc::new(QuotaEnforcer::with_defaults(
        Arc::new(InMemoryQuotaStorage::new()),
        ProjectLimits {
            metadata_items: config.metadata_items,
        },
    ));

    let controller = Arc::new(LiveImageController::new(compute, policy, quota));
    Ok(Arc::new(AppState { controller, config }))
}

pub async fn create_app(config: ApiServerConfig) -> eyre::Result<axum::Router> {
    Ok(build_router(build_state(config).await?))
}

#[cfg(test)]
mod tests;
