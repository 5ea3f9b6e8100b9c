//! Label and annotation keys read from CRI sandbox and container metadata.
//!
//! New containers carry the `io.kubernetes.*` labels set by the node agent.
//! Containers created by older agents only have the runtime-spec annotations
//! that containerd writes (`io.kubernetes.cri.*`), which are reachable through
//! the verbose `ContainerStatus` info.

use std::collections::HashMap;

pub const POD_NAME_LABEL: &str = "io.kubernetes.pod.name";
pub const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";
pub const POD_UID_LABEL: &str = "io.kubernetes.pod.uid";
pub const CONTAINER_NAME_LABEL: &str = "io.kubernetes.container.name";

pub const CONTAINER_RESTART_COUNT_ANNOTATION: &str = "io.kubernetes.container.restartCount";

// runtime-spec annotations written by containerd's CRI plugin
pub const SANDBOX_ID_ANNOTATION: &str = "io.kubernetes.cri.sandbox-id";
pub const SANDBOX_NAME_ANNOTATION: &str = "io.kubernetes.cri.sandbox-name";
pub const SANDBOX_NAMESPACE_ANNOTATION: &str = "io.kubernetes.cri.sandbox-namespace";
pub const SANDBOX_UID_ANNOTATION: &str = "io.kubernetes.cri.sandbox-uid";
pub const CONTAINER_NAME_ANNOTATION: &str = "io.kubernetes.cri.container-name";

/// Pod identity recovered from a container's labels or annotations.
///
/// Fields that could not be recovered are left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_uid: String,
    pub sandbox_id: String,
    pub container_name: String,
}

impl ContainerInfo {
    /// Tries the standard labels first and falls back to the legacy
    /// runtime-spec annotations, field by field.
    pub fn from_labels_and_annotations(
        labels: &HashMap<String, String>,
        annotations: &HashMap<String, String>,
    ) -> Self {
        let pick = |label: &str, annotation: &str| {
            labels
                .get(label)
                .filter(|v| !v.is_empty())
                .or_else(|| annotations.get(annotation).filter(|v| !v.is_empty()))
                .cloned()
                .unwrap_or_default()
        };
        Self {
            pod_name: pick(POD_NAME_LABEL, SANDBOX_NAME_ANNOTATION),
            pod_namespace: pick(POD_NAMESPACE_LABEL, SANDBOX_NAMESPACE_ANNOTATION),
            pod_uid: pick(POD_UID_LABEL, SANDBOX_UID_ANNOTATION),
            sandbox_id: annotations
                .get(SANDBOX_ID_ANNOTATION)
                .cloned()
                .unwrap_or_default(),
            container_name: pick(CONTAINER_NAME_LABEL, CONTAINER_NAME_ANNOTATION),
        }
    }

    pub fn has_pod_uid(&self) -> bool {
        !self.pod_uid.is_empty()
    }
}

/// Labels the node agent puts on a pod's sandbox so it can be selected later.
pub fn new_pod_labels(name: &str, namespace: &str, uid: &str) -> HashMap<String, String> {
    HashMap::from([
        (POD_NAME_LABEL.to_string(), name.to_string()),
        (POD_NAMESPACE_LABEL.to_string(), namespace.to_string()),
        (POD_UID_LABEL.to_string(), uid.to_string()),
    ])
}
