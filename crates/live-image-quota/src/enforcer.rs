use crate::{
    ProjectLimits, QuotaError, QuotaStorage, Resource, Result, MAX_METADATA_KEY_LEN,
};
use async_trait::async_trait;
use live_image_common::{ImageMetadata, MetadataQuota, RequestContext};
use std::sync::Arc;
use tracing::debug;

pub struct QuotaEnforcer {
    storage: Arc<dyn QuotaStorage>,
    defaults: ProjectLimits,
}

impl QuotaEnforcer {
    pub fn new(storage: Arc<dyn QuotaStorage>) -> Self {
        Self::with_defaults(storage, ProjectLimits::default())
    }

    pub fn with_defaults(storage: Arc<dyn QuotaStorage>, defaults: ProjectLimits) -> Self {
        Self { storage, defaults }
    }

    pub async fn limits(&self, project_id: &str) -> Result<ProjectLimits> {
        Ok(self
            .storage
            .get_limits(project_id)
            .await?
            .unwrap_or(self.defaults))
    }

    /// Check an absolute count against the project's limit for `resource`.
    pub async fn limit_check(
        &self,
        project_id: &str,
        resource: Resource,
        requested: u64,
    ) -> Result<()> {
        let limit = self.limits(project_id).await?.limit_for(resource);

        if requested > limit {
            return Err(QuotaError::OverQuota {
                resource,
                requested,
                limit,
            });
        }

        Ok(())
    }

    pub async fn check_image_metadata(
        &self,
        project_id: &str,
        metadata: &ImageMetadata,
    ) -> Result<()> {
        if metadata.is_empty() {
            return Ok(());
        }

        self.limit_check(project_id, Resource::MetadataItems, metadata.len() as u64)
            .await?;

        for key in metadata.keys() {
            if key.is_empty() {
                return Err(QuotaError::InvalidMetadata(
                    "Image metadata key cannot be blank".to_string(),
                ));
            }
            if key.chars().count() > MAX_METADATA_KEY_LEN {
                return Err(QuotaError::InvalidMetadata(format!(
                    "Image metadata key too long: at most {MAX_METADATA_KEY_LEN} characters"
                )));
            }
        }

        debug!(
            "Image metadata within quota for project {} ({} items)",
            project_id,
            metadata.len()
        );
        Ok(())
    }
}

#[async_trait]
impl MetadataQuota for QuotaEnforcer {
    async fn check_metadata_quota(
        &self,
        ctx: &RequestContext,
        metadata: &ImageMetadata,
    ) -> live_image_common::Result<()> {
        self.check_image_metadata(&ctx.project_id, metadata)
            .await
            .map_err(Into::into)
    }
}
