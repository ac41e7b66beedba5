use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ImageMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Active,
    Building,
    Paused,
    Suspended,
    Stopped,
    Rescued,
    Resized,
    Shelved,
    SoftDeleted,
    Deleted,
    Error,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Active => "active",
            VmState::Building => "building",
            VmState::Paused => "paused",
            VmState::Suspended => "suspended",
            VmState::Stopped => "stopped",
            VmState::Rescued => "rescued",
            VmState::Resized => "resized",
            VmState::Shelved => "shelved",
            VmState::SoftDeleted => "soft_deleted",
            VmState::Deleted => "deleted",
            VmState::Error => "error",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-flight operation on an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Scheduling,
    Spawning,
    ImageSnapshot,
    ImageLiveSnapshot,
    ImageUploading,
    Rebooting,
    Migrating,
    Resizing,
    PoweringOff,
    PoweringOn,
    Deleting,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Scheduling => "scheduling",
            TaskState::Spawning => "spawning",
            TaskState::ImageSnapshot => "image_snapshot",
            TaskState::ImageLiveSnapshot => "image_live_snapshot",
            TaskState::ImageUploading => "image_uploading",
            TaskState::Rebooting => "rebooting",
            TaskState::Migrating => "migrating",
            TaskState::Resizing => "resizing",
            TaskState::PoweringOff => "powering_off",
            TaskState::PoweringOn => "powering_on",
            TaskState::Deleting => "deleting",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub uuid: String,
    pub project_id: String,
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Image the instance booted from; `None` when booted from a volume.
    #[serde(default)]
    pub image_ref: Option<String>,
    pub vm_state: VmState,
    #[serde(default)]
    pub task_state: Option<TaskState>,
    #[serde(default)]
    pub root_device_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Image,
    Volume,
    Snapshot,
    Blank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationType {
    Local,
    Volume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    pub instance_uuid: String,
    pub source_type: SourceType,
    pub destination_type: DestinationType,
    #[serde(default)]
    pub boot_index: Option<i32>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub volume_id: Option<String>,
}

impl BlockDeviceMapping {
    pub fn is_root(&self) -> bool {
        self.boot_index == Some(0)
    }

    pub fn is_volume(&self) -> bool {
        self.destination_type == DestinationType::Volume
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockDeviceMappingList(pub Vec<BlockDeviceMapping>);

impl BlockDeviceMappingList {
    pub fn root_bdm(&self) -> Option<&BlockDeviceMapping> {
        self.0.iter().find(|bdm| bdm.is_root())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<BlockDeviceMapping>> for BlockDeviceMappingList {
    fn from(bdms: Vec<BlockDeviceMapping>) -> Self {
        Self(bdms)
    }
}

/// Image registered by a live snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotImage {
    pub id: String,
    pub name: String,
    pub instance_uuid: String,
    pub status: String,
    pub properties: ImageMetadata,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bdm(boot_index: Option<i32>, destination_type: DestinationType) -> BlockDeviceMapping {
        BlockDeviceMapping {
            instance_uuid: "inst-1".to_string(),
            source_type: SourceType::Volume,
            destination_type,
            boot_index,
            device_name: None,
            volume_id: Some("vol-1".to_string()),
        }
    }

    #[test]
    fn test_root_bdm_is_boot_index_zero() {
        let bdms = BlockDeviceMappingList(vec![
            bdm(None, DestinationType::Volume),
            bdm(Some(1), DestinationType::Volume),
            bdm(Some(0), DestinationType::Local),
        ]);
        let root = bdms.root_bdm().unwrap();
        assert_eq!(root.boot_index, Some(0));
        assert!(!root.is_volume());
    }

    #[test]
    fn test_no_root_bdm() {
        let bdms = BlockDeviceMappingList(vec![bdm(Some(2), DestinationType::Volume)]);
        assert!(bdms.root_bdm().is_none());
        assert!(BlockDeviceMappingList::default().root_bdm().is_none());
    }

    #[test]
    fn test_states_serialize_snake_case() {
        let json = serde_json::to_string(&VmState::SoftDeleted).unwrap();
        assert_eq!(json, "\"soft_deleted\"");
        let state: TaskState = serde_json::from_str("\"image_live_snapshot\"").unwrap();
        assert_eq!(state, TaskState::ImageLiveSnapshot);
    }

    #[test]
    fn test_instance_defaults_optional_fields() {
        let instance: Instance = serde_json::from_str(
            r#"{"uuid": "i-1", "project_id": "p", "user_id": "u", "vm_state": "active"}"#,
        )
        .unwrap();
        assert!(instance.image_ref.is_none());
        assert!(instance.task_state.is_none());
    }
}
