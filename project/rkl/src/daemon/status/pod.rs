//! Runtime manager: turns raw CRI objects into the pod model PLEG diffs.
//!
//! [`RuntimeManager::get_pods`] groups every sandbox and container the runtime
//! knows about by pod uid, producing [`Pod`] snapshots. Containers created by
//! older agents carry no pod labels; their identity is recovered from the
//! runtime-spec annotations in the verbose `ContainerStatus` info.
//! [`RuntimeManager::get_pod_status`] builds the detailed [`PodStatus`] for a
//! single pod.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    Container, ContainerId, ContainerState, ContainerStatus, Pod, PodStatus, SandboxState,
    SandboxStatus,
    labels::{CONTAINER_RESTART_COUNT_ANNOTATION, ContainerInfo, POD_UID_LABEL},
};
use libruntime::cri::{
    Cri, ListContainerOptions, ListPodOptions,
    cri_api::{self, PodSandboxState},
};
use serde::Deserialize;
use tracing::{debug, warn};

/// Pod-level view of the container runtime consumed by PLEG.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Lists pods with their containers and sandboxes. With `all == false`
    /// only ready sandboxes and running containers are returned.
    async fn get_pods(&self, all: bool) -> anyhow::Result<Vec<Pod>>;

    async fn get_pod_status(
        &self,
        uid: &str,
        name: &str,
        namespace: &str,
    ) -> anyhow::Result<PodStatus>;
}

/// [`Runtime`] implementation over a CRI endpoint.
pub struct RuntimeManager {
    runtime_name: String,
    cri: Arc<dyn Cri>,
}

impl std::fmt::Debug for RuntimeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeManager")
            .field("runtime_name", &self.runtime_name)
            .finish()
    }
}

impl RuntimeManager {
    pub fn new(runtime_name: impl Into<String>, cri: Arc<dyn Cri>) -> Self {
        Self {
            runtime_name: runtime_name.into(),
            cri,
        }
    }

    /// Asks the runtime for its name so container ids can be qualified with it.
    pub async fn try_new(cri: Arc<dyn Cri>) -> anyhow::Result<Self> {
        let version = cri
            .version()
            .await
            .context("failed to query container runtime version")?;
        debug!(
            runtime_name = %version.runtime_name,
            runtime_version = %version.runtime_version,
            runtime_api_version = %version.runtime_api_version,
            "[runtime] Connected to container runtime"
        );
        Ok(Self::new(version.runtime_name, cri))
    }

    pub fn runtime_name(&self) -> &str {
        &self.runtime_name
    }

    pub fn cri(&self) -> &Arc<dyn Cri> {
        &self.cri
    }

    fn sandbox_to_container(&self, sandbox: &cri_api::PodSandbox) -> Container {
        let state = match PodSandboxState::try_from(sandbox.state) {
            Ok(PodSandboxState::SandboxReady) => ContainerState::Running,
            Ok(PodSandboxState::SandboxNotready) => ContainerState::Exited,
            Err(_) => ContainerState::Unknown,
        };
        Container {
            id: ContainerId::new(&self.runtime_name, &sandbox.id),
            name: sandbox
                .metadata
                .as_ref()
                .map(|m| m.name.clone())
                .unwrap_or_default(),
            image: String::new(),
            image_id: String::new(),
            state,
        }
    }

    fn to_container(&self, container: &cri_api::Container, name: String) -> Container {
        Container {
            id: ContainerId::new(&self.runtime_name, &container.id),
            name,
            image: container
                .image
                .as_ref()
                .map(|i| i.image.clone())
                .unwrap_or_default(),
            image_id: container.image_ref.clone(),
            state: to_container_state(container.state),
        }
    }

    /// Recovers pod identity for a container without pod labels from the
    /// runtime-spec annotations in its verbose status.
    async fn container_info_from_annotations(
        &self,
        container: &cri_api::Container,
    ) -> anyhow::Result<Option<ContainerInfo>> {
        let resp = match self.cri.container_status(&container.id, true).await {
            Ok(resp) => resp,
            Err(e) if e.is_not_found() => {
                debug!(container_id = %container.id, "[runtime] Container vanished before inspection");
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to inspect legacy container {}", container.id)
                });
            }
        };
        let verbose = resp
            .info
            .get("info")
            .map(|raw| parse_verbose_info(raw))
            .unwrap_or_default();
        let mut info = ContainerInfo::from_labels_and_annotations(
            &container.labels,
            &verbose.runtime_spec.annotations,
        );
        if info.sandbox_id.is_empty() {
            info.sandbox_id = verbose.sandbox_id;
        }
        Ok(Some(info))
    }

    async fn list_sandboxes_for_pod(&self, uid: &str) -> anyhow::Result<Vec<cri_api::PodSandbox>> {
        let selector = HashMap::from([(POD_UID_LABEL.to_string(), uid.to_string())]);
        let mut sandboxes = self
            .cri
            .list_pods(ListPodOptions::with_labels(selector))
            .await
            .with_context(|| format!("failed to list sandboxes of pod {uid}"))?;

        if sandboxes.is_empty() {
            // sandboxes created without pod labels
            sandboxes = match self.cri.list_pods(ListPodOptions::default()).await {
                Ok(all) => all
                    .into_iter()
                    .filter(|s| s.metadata.as_ref().is_some_and(|m| m.uid == uid))
                    .collect(),
                Err(e) if e.is_not_found() => Vec::new(),
                Err(e) => return Err(e).context("failed to list sandboxes"),
            };
        }
        sandboxes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sandboxes)
    }

    async fn list_containers_for_pod(
        &self,
        uid: &str,
        sandbox_ids: &HashSet<&str>,
    ) -> anyhow::Result<Vec<cri_api::Container>> {
        let selector = HashMap::from([(POD_UID_LABEL.to_string(), uid.to_string())]);
        let containers = self
            .cri
            .list_containers(ListContainerOptions::with_labels(selector))
            .await
            .with_context(|| format!("failed to list containers of pod {uid}"))?;
        if !containers.is_empty() {
            return Ok(containers);
        }

        match self.cri.list_containers(ListContainerOptions::default()).await {
            Ok(all) => Ok(all
                .into_iter()
                .filter(|c| sandbox_ids.contains(c.pod_sandbox_id.as_str()))
                .collect()),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e).context("failed to list containers"),
        }
    }
}

#[async_trait]
impl Runtime for RuntimeManager {
    async fn get_pods(&self, all: bool) -> anyhow::Result<Vec<Pod>> {
        let sandbox_opts = if all {
            ListPodOptions::default()
        } else {
            ListPodOptions::ready()
        };
        let sandboxes = self
            .cri
            .list_pods(sandbox_opts)
            .await
            .context("failed to list pod sandboxes")?;

        let mut pods: Vec<Pod> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut sandbox_owner: HashMap<String, String> = HashMap::new();
        let mut newest_sandbox: HashMap<String, i64> = HashMap::new();

        for sandbox in &sandboxes {
            let Some(metadata) = sandbox.metadata.as_ref().filter(|m| !m.uid.is_empty()) else {
                warn!(sandbox_id = %sandbox.id, "[runtime] Sandbox has no pod uid, skipping");
                continue;
            };
            let slot = *index.entry(metadata.uid.clone()).or_insert_with(|| {
                pods.push(Pod {
                    id: metadata.uid.clone(),
                    name: metadata.name.clone(),
                    namespace: metadata.namespace.clone(),
                    ..Default::default()
                });
                pods.len() - 1
            });
            let pod = &mut pods[slot];
            let container = self.sandbox_to_container(sandbox);
            if pod.sandboxes.iter().any(|s| s.id == container.id) {
                continue;
            }
            pod.sandboxes.push(container);
            sandbox_owner.insert(sandbox.id.clone(), metadata.uid.clone());

            let newest = newest_sandbox.entry(metadata.uid.clone()).or_insert(i64::MIN);
            if sandbox.created_at >= *newest {
                *newest = sandbox.created_at;
                pod.sandbox_id = sandbox.id.clone();
            }
        }

        let container_opts = if all {
            ListContainerOptions::default()
        } else {
            ListContainerOptions::running()
        };
        let containers = self
            .cri
            .list_containers(container_opts)
            .await
            .context("failed to list containers")?;

        for container in &containers {
            let mut info =
                ContainerInfo::from_labels_and_annotations(&container.labels, &container.annotations);
            if !info.has_pod_uid() {
                match self.container_info_from_annotations(container).await? {
                    Some(legacy) => info = legacy,
                    None => continue,
                }
            }
            if !info.has_pod_uid() {
                let sandbox_id = if info.sandbox_id.is_empty() {
                    &container.pod_sandbox_id
                } else {
                    &info.sandbox_id
                };
                if let Some(uid) = sandbox_owner.get(sandbox_id) {
                    info.pod_uid = uid.clone();
                }
            }
            if !info.has_pod_uid() {
                warn!(
                    container_id = %container.id,
                    "[runtime] Unable to determine pod of container, skipping"
                );
                continue;
            }

            let slot = *index.entry(info.pod_uid.clone()).or_insert_with(|| {
                pods.push(Pod {
                    id: info.pod_uid.clone(),
                    sandbox_id: container.pod_sandbox_id.clone(),
                    name: info.pod_name.clone(),
                    namespace: info.pod_namespace.clone(),
                    ..Default::default()
                });
                pods.len() - 1
            });
            let name = if info.container_name.is_empty() {
                container
                    .metadata
                    .as_ref()
                    .map(|m| m.name.clone())
                    .unwrap_or_default()
            } else {
                info.container_name
            };
            let converted = self.to_container(container, name);
            let pod = &mut pods[slot];
            if pod.containers.iter().any(|c| c.id == converted.id) {
                continue;
            }
            pod.containers.push(converted);
        }

        debug!(
            sandbox_count = sandboxes.len(),
            container_count = containers.len(),
            pod_count = pods.len(),
            "[runtime] Built pod snapshots"
        );
        Ok(pods)
    }

    async fn get_pod_status(
        &self,
        uid: &str,
        name: &str,
        namespace: &str,
    ) -> anyhow::Result<PodStatus> {
        let sandboxes = self.list_sandboxes_for_pod(uid).await?;

        let mut sandbox_statuses = Vec::with_capacity(sandboxes.len());
        let mut ips = Vec::new();
        let mut found_ready = false;
        for sandbox in &sandboxes {
            let resp = match self.cri.pod_sandbox_status(&sandbox.id, false).await {
                Ok(resp) => resp,
                Err(e) if e.is_not_found() => {
                    debug!(sandbox_id = %sandbox.id, "[runtime] Sandbox vanished before inspection");
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to get status of sandbox {}", sandbox.id)
                    });
                }
            };
            let Some(status) = resp.status else {
                warn!(sandbox_id = %sandbox.id, "[runtime] Runtime returned an empty sandbox status");
                continue;
            };
            let converted = to_sandbox_status(&status);
            // only the newest ready sandbox provides IPs
            if !found_ready && converted.state == SandboxState::Ready {
                found_ready = true;
                ips = converted.ips.clone();
            }
            sandbox_statuses.push(converted);
        }

        let sandbox_ids: HashSet<&str> = sandboxes.iter().map(|s| s.id.as_str()).collect();
        let containers = self.list_containers_for_pod(uid, &sandbox_ids).await?;

        let mut container_statuses = Vec::with_capacity(containers.len());
        for container in &containers {
            let resp = match self.cri.container_status(&container.id, false).await {
                Ok(resp) => resp,
                Err(e) if e.is_not_found() => {
                    debug!(container_id = %container.id, "[runtime] Container vanished before inspection");
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to get status of container {}", container.id)
                    });
                }
            };
            let Some(status) = resp.status else {
                warn!(container_id = %container.id, "[runtime] Runtime returned an empty container status");
                continue;
            };
            container_statuses.push(to_container_status(
                &self.runtime_name,
                &container.pod_sandbox_id,
                &status,
            ));
        }
        container_statuses.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(PodStatus {
            id: uid.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            ips,
            container_statuses,
            sandbox_statuses,
        })
    }
}

fn to_container_state(state: i32) -> ContainerState {
    match cri_api::ContainerState::try_from(state) {
        Ok(cri_api::ContainerState::ContainerCreated) => ContainerState::Created,
        Ok(cri_api::ContainerState::ContainerRunning) => ContainerState::Running,
        Ok(cri_api::ContainerState::ContainerExited) => ContainerState::Exited,
        _ => ContainerState::Unknown,
    }
}

fn timestamp(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

/// Converts a CRI container status into the shared model.
///
/// The restart count is best effort: a missing or malformed annotation yields
/// zero.
pub fn to_container_status(
    runtime_name: &str,
    pod_sandbox_id: &str,
    status: &cri_api::ContainerStatus,
) -> ContainerStatus {
    let restart_count = match status.annotations.get(CONTAINER_RESTART_COUNT_ANNOTATION) {
        Some(raw) => raw.parse::<u32>().unwrap_or_else(|e| {
            warn!(
                container_id = %status.id,
                value = %raw,
                error = %e,
                "[runtime] Invalid restart count annotation, using 0"
            );
            0
        }),
        None => 0,
    };
    let state = to_container_state(status.state);
    let mut converted = ContainerStatus {
        id: ContainerId::new(runtime_name, &status.id),
        name: status
            .metadata
            .as_ref()
            .map(|m| m.name.clone())
            .unwrap_or_default(),
        pod_sandbox_id: pod_sandbox_id.to_string(),
        state,
        created_at: timestamp(status.created_at),
        started_at: None,
        finished_at: None,
        exit_code: 0,
        image: status
            .image
            .as_ref()
            .map(|i| i.image.clone())
            .unwrap_or_default(),
        image_id: status.image_ref.clone(),
        restart_count,
        reason: String::new(),
        message: String::new(),
    };
    if state != ContainerState::Created {
        converted.started_at = Some(timestamp(status.started_at));
    }
    if state == ContainerState::Exited {
        converted.finished_at = Some(timestamp(status.finished_at));
        converted.exit_code = status.exit_code;
        converted.reason = status.reason.clone();
        converted.message = status.message.clone();
    }
    converted
}

fn to_sandbox_status(status: &cri_api::PodSandboxStatus) -> SandboxStatus {
    let metadata = status.metadata.clone().unwrap_or_default();
    let state = match PodSandboxState::try_from(status.state) {
        Ok(PodSandboxState::SandboxReady) => SandboxState::Ready,
        _ => SandboxState::NotReady,
    };
    SandboxStatus {
        id: status.id.clone(),
        name: metadata.name,
        namespace: metadata.namespace,
        uid: metadata.uid,
        attempt: metadata.attempt,
        state,
        created_at: timestamp(status.created_at),
        ips: sandbox_ips(status),
    }
}

/// Primary IP first, then the additional ones. An unparseable primary IP
/// invalidates the whole set; unparseable additional IPs are dropped.
fn sandbox_ips(status: &cri_api::PodSandboxStatus) -> Vec<String> {
    let Some(network) = status.network.as_ref() else {
        return Vec::new();
    };
    if network.ip.parse::<IpAddr>().is_err() {
        if !network.ip.is_empty() {
            warn!(
                sandbox_id = %status.id,
                ip = %network.ip,
                "[runtime] Sandbox reported an invalid primary IP"
            );
        }
        return Vec::new();
    }
    let mut ips = vec![network.ip.clone()];
    for extra in &network.additional_ips {
        if extra.ip.parse::<IpAddr>().is_err() {
            warn!(
                sandbox_id = %status.id,
                ip = %extra.ip,
                "[runtime] Sandbox reported an invalid additional IP, skipping"
            );
            continue;
        }
        ips.push(extra.ip.clone());
    }
    ips
}

#[derive(Debug, Default, Deserialize)]
struct VerboseInfo {
    #[serde(rename = "sandboxID", default)]
    sandbox_id: String,
    #[serde(rename = "runtimeSpec", default)]
    runtime_spec: RuntimeSpec,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimeSpec {
    #[serde(default)]
    annotations: HashMap<String, String>,
}

fn parse_verbose_info(raw: &str) -> VerboseInfo {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(error = %e, "[runtime] Failed to parse verbose container info");
        VerboseInfo::default()
    })
}
