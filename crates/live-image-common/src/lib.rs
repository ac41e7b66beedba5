// Re-export dependencies used in public interfaces of common types

use std::collections::BTreeMap;
use std::fmt::Display;

use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

mod instance;

pub use instance::{
    BlockDeviceMapping, BlockDeviceMappingList, DestinationType, Instance, SnapshotImage,
    SourceType, TaskState, VmState,
};

/// Image properties attached to a snapshot.
pub type ImageMetadata = BTreeMap<String, String>;

/// Attributes a policy rule may be matched against (`project_id`, `user_id`, ...).
pub type PolicyTarget = BTreeMap<String, String>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    #[error("Instance {0} could not be found.")]
    InstanceNotFound(String),

    #[error("Instance {instance_uuid} in {attr} {state}. Cannot {method} while the instance is in this state.")]
    InstanceInvalidState {
        instance_uuid: String,
        attr: String,
        state: String,
        method: String,
    },

    #[error("Policy doesn't allow {action} to be performed.")]
    PolicyNotAuthorized { action: String },

    #[error("Invalid image metadata: {0}")]
    InvalidMetadata(String),

    #[error("Quota exceeded for {resource}: requested {requested}, limit {limit}")]
    OverQuota {
        resource: String,
        requested: u64,
        limit: u64,
    },

    #[error("Image registration failed: {0}")]
    ImageRegistration(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ComputeError>;

/// Caller identity and project scope, established by the authenticating
/// front end before any handler runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: String,
    pub project_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub is_admin: bool,
}

impl RequestContext {
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
            user_id: user_id.into(),
            project_id: project_id.into(),
            roles: Vec::new(),
            is_admin: false,
        }
    }

    /// Replaces the role list. Holding the `admin` role makes the context
    /// an admin context.
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self.is_admin = self.has_role("admin");
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    /// Default target for extension-level checks: the caller's own scope.
    pub fn default_target(&self) -> PolicyTarget {
        PolicyTarget::from([
            ("project_id".to_string(), self.project_id.clone()),
            ("user_id".to_string(), self.user_id.clone()),
        ])
    }
}

impl Display for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RequestContext(request_id: {}, user: {}, project: {}, admin: {})",
            self.request_id, self.user_id, self.project_id, self.is_admin
        )
    }
}

#[async_trait]
pub trait PolicyEnforcer: Send + Sync {
    /// `Ok(())` when `action` is allowed for `ctx` against `target`,
    /// `ComputeError::PolicyNotAuthorized` otherwise.
    async fn authorize(&self, ctx: &RequestContext, action: &str, target: &PolicyTarget)
        -> Result<()>;
}

#[async_trait]
pub trait MetadataQuota: Send + Sync {
    async fn check_metadata_quota(&self, ctx: &RequestContext, metadata: &ImageMetadata)
        -> Result<()>;
}

/// Compute-management operations the API layer relies on.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Look up an instance visible to `ctx`.
    async fn get(&self, ctx: &RequestContext, instance_id: &str) -> Result<Instance>;

    async fn get_instance_bdms(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
    ) -> Result<BlockDeviceMappingList>;

    async fn is_volume_backed_instance(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        bdms: &BlockDeviceMappingList,
    ) -> Result<bool>;

    /// Start a live snapshot. Returns once the image is registered; the
    /// capture itself continues out of band.
    async fn live_snapshot(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        name: &str,
        extra_properties: ImageMetadata,
    ) -> Result<SnapshotImage>;
}
