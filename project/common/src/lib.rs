//! Data model shared between the CRI client, the runtime manager and PLEG.
//!
//! A [`Pod`] is the runtime's view of a pod at one relist: its application
//! containers and its sandboxes, both as [`Container`] values so that the PLEG
//! diff engine can treat them uniformly. A [`PodStatus`] is the detailed view
//! produced on demand for pods whose containers changed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod labels;

/// Caller-assigned pod identifier (the node agent's pod uid).
pub type PodUid = String;

/// Identity of a container inside a specific runtime.
///
/// Two ids are equal only if both the runtime name and the id string match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId {
    /// Runtime name as reported by CRI `Version` (e.g. `containerd`).
    #[serde(rename = "type")]
    pub runtime: String,
    /// Runtime-assigned container or sandbox id.
    pub id: String,
}

impl ContainerId {
    pub fn new(runtime: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.runtime, self.id)
    }
}

/// Coarse container state as reported by the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    #[default]
    Unknown,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A container (or a sandbox modeled as a container) inside a [`Pod`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub name: String,
    /// Image reference, `repo:tag`.
    pub image: String,
    /// Image digest / id.
    pub image_id: String,
    pub state: ContainerState,
}

/// A pod as observed by one relist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub id: PodUid,
    /// Runtime-assigned id of the newest sandbox seen for this pod.
    pub sandbox_id: String,
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub sandboxes: Vec<Container>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Pod {
    /// Looks the id up among the application containers first, then the
    /// sandboxes.
    pub fn find_container_by_id(&self, id: &ContainerId) -> Option<&Container> {
        self.containers
            .iter()
            .chain(self.sandboxes.iter())
            .find(|c| &c.id == id)
    }

    /// Ids of all containers and sandboxes of this pod, containers first.
    pub fn container_ids(&self) -> impl Iterator<Item = &ContainerId> {
        self.containers
            .iter()
            .chain(self.sandboxes.iter())
            .map(|c| &c.id)
    }
}

/// Detailed status of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub id: ContainerId,
    pub name: String,
    pub pod_sandbox_id: String,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
    /// Only set once the container left the `Created` state.
    pub started_at: Option<DateTime<Utc>>,
    /// Only set for exited containers.
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: i32,
    pub image: String,
    pub image_id: String,
    pub restart_count: u32,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Ready,
    #[default]
    NotReady,
}

/// Status of one pod sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub uid: PodUid,
    pub attempt: u32,
    pub state: SandboxState,
    pub created_at: DateTime<Utc>,
    /// Primary ip first, then any additional ips, as reported by the runtime.
    pub ips: Vec<String>,
}

/// Aggregated status of a pod: ips, per-container statuses (newest first)
/// and sandbox statuses (newest first).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    pub id: PodUid,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
    #[serde(default)]
    pub sandbox_statuses: Vec<SandboxStatus>,
}

impl PodStatus {
    pub fn has_ready_sandbox(&self) -> bool {
        self.sandbox_statuses
            .iter()
            .any(|s| s.state == SandboxState::Ready)
    }
}
