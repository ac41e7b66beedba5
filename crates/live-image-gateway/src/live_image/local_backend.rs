//! In-process compute backend
//!
//! Keeps instances, block device mappings and registered images in memory.
//! Used by the standalone server and by tests.

use async_trait::async_trait;
use dashmap::DashMap;
use live_image_common::{
    BlockDeviceMapping, BlockDeviceMappingList, ComputeApi, ComputeError, ImageMetadata,
    Instance, PolicyEnforcer, PolicyTarget, RequestContext, Result, SnapshotImage, VmState,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, instrument};

/// Policy the backend enforces itself before snapshotting.
pub const LIVE_SNAPSHOT_POLICY: &str = "compute:live_snapshot";

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Failed to read inventory: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid inventory: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Seed data for [`InMemoryCompute`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub instances: Vec<InventoryInstance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryInstance {
    #[serde(flatten)]
    pub instance: Instance,
    #[serde(default)]
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

impl Inventory {
    pub async fn from_file(path: impl AsRef<Path>) -> std::result::Result<Self, InventoryError> {
        let document = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&document)?)
    }
}

pub struct InMemoryCompute {
    instances: Arc<RwLock<HashMap<String, Instance>>>,
    bdms: Arc<RwLock<HashMap<String, Vec<BlockDeviceMapping>>>>,
    images: Arc<DashMap<String, SnapshotImage>>,
    policy: Arc<dyn PolicyEnforcer>,
}

impl InMemoryCompute {
    pub fn new(policy: Arc<dyn PolicyEnforcer>) -> Self {
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
            bdms: Arc::new(RwLock::new(HashMap::new())),
            images: Arc::new(DashMap::new()),
            policy,
        }
    }

    pub async fn with_inventory(policy: Arc<dyn PolicyEnforcer>, inventory: Inventory) -> Self {
        let compute = Self::new(policy);
        for entry in inventory.instances {
            compute
                .add_instance(entry.instance, entry.block_device_mappings)
                .await;
        }
        compute
    }

    pub async fn add_instance(&self, instance: Instance, bdms: Vec<BlockDeviceMapping>) {
        let uuid = instance.uuid.clone();
        self.instances.write().await.insert(uuid.clone(), instance);
        self.bdms.write().await.insert(uuid, bdms);
    }

    /// Change power/task state, as the compute service would while an
    /// operation is in flight.
    pub async fn set_state(
        &self,
        instance_uuid: &str,
        vm_state: VmState,
        task_state: Option<live_image_common::TaskState>,
    ) -> Result<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(instance_uuid)
            .ok_or_else(|| ComputeError::InstanceNotFound(instance_uuid.to_string()))?;
        instance.vm_state = vm_state;
        instance.task_state = task_state;
        Ok(())
    }

    pub fn image(&self, image_id: &str) -> Option<SnapshotImage> {
        self.images.get(image_id).map(|entry| entry.value().clone())
    }

    pub fn images(&self) -> Vec<SnapshotImage> {
        self.images
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }
}

/// Live snapshots need a running or paused guest with nothing in flight.
fn check_live_snapshot_state(instance: &Instance) -> Result<()> {
    if !matches!(instance.vm_state, VmState::Active | VmState::Paused) {
        return Err(ComputeError::InstanceInvalidState {
            instance_uuid: instance.uuid.clone(),
            attr: "vm_state".to_string(),
            state: instance.vm_state.to_string(),
            method: "live_snapshot".to_string(),
        });
    }

    if let Some(task_state) = instance.task_state {
        return Err(ComputeError::InstanceInvalidState {
            instance_uuid: instance.uuid.clone(),
            attr: "task_state".to_string(),
            state: task_state.to_string(),
            method: "live_snapshot".to_string(),
        });
    }

    Ok(())
}

#[async_trait]
impl ComputeApi for InMemoryCompute {
    async fn get(&self, ctx: &RequestContext, instance_id: &str) -> Result<Instance> {
        let instances = self.instances.read().await;
        instances
            .get(instance_id)
            .filter(|i| !matches!(i.vm_state, VmState::Deleted | VmState::SoftDeleted))
            .filter(|i| ctx.is_admin || i.project_id == ctx.project_id)
            .cloned()
            .ok_or_else(|| ComputeError::InstanceNotFound(instance_id.to_string()))
    }

    async fn get_instance_bdms(
        &self,
        _ctx: &RequestContext,
        instance: &Instance,
    ) -> Result<BlockDeviceMappingList> {
        let bdms = self.bdms.read().await;
        Ok(bdms
            .get(&instance.uuid)
            .cloned()
            .unwrap_or_default()
            .into())
    }

    async fn is_volume_backed_instance(
        &self,
        _ctx: &RequestContext,
        instance: &Instance,
        bdms: &BlockDeviceMappingList,
    ) -> Result<bool> {
        if instance.image_ref.as_deref().map_or(true, str::is_empty) {
            return Ok(true);
        }

        Ok(bdms.root_bdm().is_some_and(|root| root.is_volume()))
    }

    #[instrument(skip(self, ctx, instance, extra_properties), fields(instance = %instance.uuid))]
    async fn live_snapshot(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        name: &str,
        extra_properties: ImageMetadata,
    ) -> Result<SnapshotImage> {
        let target = PolicyTarget::from([
            ("project_id".to_string(), instance.project_id.clone()),
            ("user_id".to_string(), instance.user_id.clone()),
        ]);
        self.policy
            .authorize(ctx, LIVE_SNAPSHOT_POLICY, &target)
            .await?;

        // State may have moved on since the caller looked the instance up
        let current = {
            let instances = self.instances.read().await;
            instances
                .get(&instance.uuid)
                .cloned()
                .ok_or_else(|| ComputeError::InstanceNotFound(instance.uuid.clone()))?
        };
        check_live_snapshot_state(&current)?;

        let mut properties = extra_properties;
        properties.insert("instance_uuid".to_string(), current.uuid.clone());
        properties.insert("image_type".to_string(), "live-snapshot".to_string());
        properties.insert("user_id".to_string(), ctx.user_id.clone());
        properties.insert("owner".to_string(), ctx.project_id.clone());
        if let Some(base) = &current.image_ref {
            properties.insert("base_image_ref".to_string(), base.clone());
        }

        let image = SnapshotImage {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            instance_uuid: current.uuid.clone(),
            status: "queued".to_string(),
            properties,
            created_at: chrono::Utc::now(),
        };
        self.images.insert(image.id.clone(), image.clone());

        info!(
            "Registered live snapshot image {} ({}) for instance {}",
            image.id, image.name, image.instance_uuid
        );

        Ok(image)
    }
}
