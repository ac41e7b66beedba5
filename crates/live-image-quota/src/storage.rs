use crate::{ProjectLimits, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait QuotaStorage: Send + Sync {
    /// Per-project override, `None` when the project uses the defaults.
    async fn get_limits(&self, project_id: &str) -> Result<Option<ProjectLimits>>;
    async fn set_limits(&self, project_id: &str, limits: ProjectLimits) -> Result<()>;
    async fn clear_limits(&self, project_id: &str) -> Result<()>;
}

// In-memory storage implementation for development/testing
#[derive(Default)]
pub struct InMemoryQuotaStorage {
    overrides: Arc<RwLock<HashMap<String, ProjectLimits>>>,
}

impl InMemoryQuotaStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStorage for InMemoryQuotaStorage {
    async fn get_limits(&self, project_id: &str) -> Result<Option<ProjectLimits>> {
        Ok(self.overrides.read().await.get(project_id).copied())
    }

    async fn set_limits(&self, project_id: &str, limits: ProjectLimits) -> Result<()> {
        self.overrides
            .write()
            .await
            .insert(project_id.to_string(), limits);
        Ok(())
    }

    async fn clear_limits(&self, project_id: &str) -> Result<()> {
        self.overrides.write().await.remove(project_id);
        Ok(())
    }
}
