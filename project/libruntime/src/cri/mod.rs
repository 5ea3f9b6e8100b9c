//! Typed access to a Container Runtime Interface (CRI) endpoint.
//!
//! [`Cri`] is the seam the rest of the node daemon programs against; the
//! production implementation is [`CriClient`], which speaks gRPC to the
//! runtime over a Unix socket. The trait is stateless: every call is a single
//! request with its own deadline and retries are left to the caller.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, info};

pub mod client;
pub mod cri_api;
pub mod error;

pub use client::{CriClient, CriClientConfig, CriEndpoint};
pub use error::CriError;

use cri_api::{
    Container, ContainerConfig, ContainerFilter, ContainerState, ContainerStateValue,
    ContainerStatusResponse, ExecSyncResponse, Image, ImageFilter, ImageStatusRequest,
    ImageStatusResponse, PodSandbox, PodSandboxConfig, PodSandboxFilter, PodSandboxState,
    PodSandboxStateValue, PodSandboxStatusResponse, PullImageRequest, PullImageResponse,
    StopPodSandboxRequest, VersionResponse,
};

/// Filter for [`Cri::list_pods`]. Empty fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPodOptions {
    pub id: Option<String>,
    pub state: Option<PodSandboxState>,
    pub labels: HashMap<String, String>,
}

impl ListPodOptions {
    /// Only sandboxes in the `SANDBOX_READY` state.
    pub fn ready() -> Self {
        Self {
            state: Some(PodSandboxState::SandboxReady),
            ..Default::default()
        }
    }

    pub fn with_labels(labels: HashMap<String, String>) -> Self {
        Self {
            labels,
            ..Default::default()
        }
    }

    pub fn to_filter(&self) -> PodSandboxFilter {
        PodSandboxFilter {
            id: self.id.clone().unwrap_or_default(),
            state: self.state.map(|s| PodSandboxStateValue { state: s as i32 }),
            label_selector: self.labels.clone(),
        }
    }
}

/// Filter for [`Cri::list_containers`]. Empty fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListContainerOptions {
    pub id: Option<String>,
    pub pod_id: Option<String>,
    pub state: Option<ContainerState>,
    pub labels: HashMap<String, String>,
}

impl ListContainerOptions {
    /// Only containers in the `CONTAINER_RUNNING` state.
    pub fn running() -> Self {
        Self {
            state: Some(ContainerState::ContainerRunning),
            ..Default::default()
        }
    }

    pub fn with_labels(labels: HashMap<String, String>) -> Self {
        Self {
            labels,
            ..Default::default()
        }
    }

    pub fn to_filter(&self) -> ContainerFilter {
        ContainerFilter {
            id: self.id.clone().unwrap_or_default(),
            state: self.state.map(|s| ContainerStateValue { state: s as i32 }),
            pod_sandbox_id: self.pod_id.clone().unwrap_or_default(),
            label_selector: self.labels.clone(),
        }
    }
}

/// Result of [`Cri::run_containers`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunContainersResponse {
    pub pod_id: String,
    pub container_ids: Vec<String>,
}

/// Operations the node daemon needs from a container runtime.
#[async_trait]
pub trait Cri: Send + Sync {
    async fn version(&self) -> Result<VersionResponse, CriError>;

    async fn list_pods(&self, opts: ListPodOptions) -> Result<Vec<PodSandbox>, CriError>;

    async fn list_containers(&self, opts: ListContainerOptions)
    -> Result<Vec<Container>, CriError>;

    async fn pod_sandbox_status(
        &self,
        pod_id: &str,
        verbose: bool,
    ) -> Result<PodSandboxStatusResponse, CriError>;

    async fn container_status(
        &self,
        container_id: &str,
        verbose: bool,
    ) -> Result<ContainerStatusResponse, CriError>;

    /// Creates and starts a pod sandbox, returning its id.
    async fn run_pod_sandbox(
        &self,
        config: PodSandboxConfig,
        runtime_handler: &str,
    ) -> Result<String, CriError>;

    async fn stop_pod_sandbox(&self, req: StopPodSandboxRequest) -> Result<(), CriError>;

    async fn remove_pod_sandbox(&self, pod_id: &str) -> Result<(), CriError>;

    /// Creates a container inside `pod_id`, returning its id.
    async fn create_container(
        &self,
        pod_id: &str,
        pod_config: &PodSandboxConfig,
        config: ContainerConfig,
    ) -> Result<String, CriError>;

    async fn start_container(&self, container_id: &str) -> Result<(), CriError>;

    /// Stops a container, giving it `timeout` seconds before it is killed.
    async fn stop_container(&self, container_id: &str, timeout: i64) -> Result<(), CriError>;

    async fn remove_container(&self, container_id: &str) -> Result<(), CriError>;

    async fn list_images(&self, filter: Option<ImageFilter>) -> Result<Vec<Image>, CriError>;

    async fn pull_image(&self, req: PullImageRequest) -> Result<PullImageResponse, CriError>;

    async fn image_status(&self, req: ImageStatusRequest)
    -> Result<ImageStatusResponse, CriError>;

    /// Runs `cmd` inside the container and waits for it. `timeout` is in
    /// seconds, zero for none. A non-zero exit code is not an error at this
    /// level.
    async fn exec_sync(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        timeout: i64,
    ) -> Result<ExecSyncResponse, CriError>;

    /// Creates a sandbox, then pulls, creates and starts every container in
    /// order. Stops at the first failure; containers already started are left
    /// running for the caller to clean up.
    async fn run_containers(
        &self,
        pod_config: PodSandboxConfig,
        container_configs: Vec<ContainerConfig>,
        runtime_handler: &str,
    ) -> Result<RunContainersResponse, CriError> {
        let pod_id = self.run_pod_sandbox(pod_config.clone(), runtime_handler).await?;
        info!(pod_id = %pod_id, "[cri] pod sandbox created");

        let mut resp = RunContainersResponse {
            pod_id,
            container_ids: Vec::with_capacity(container_configs.len()),
        };
        for (index, config) in container_configs.into_iter().enumerate() {
            if let Some(image) = config.image.clone() {
                let pulled = self
                    .pull_image(PullImageRequest {
                        image: Some(image),
                        auth: None,
                        sandbox_config: Some(pod_config.clone()),
                    })
                    .await
                    .map_err(|e| step_error(index, "PullImage", e))?;
                debug!(index, image_ref = %pulled.image_ref, "[cri] image pulled");
            }

            let container_id = self
                .create_container(&resp.pod_id, &pod_config, config)
                .await
                .map_err(|e| step_error(index, "CreateContainer", e))?;
            self.start_container(&container_id)
                .await
                .map_err(|e| step_error(index, "StartContainer", e))?;
            debug!(index, container_id = %container_id, "[cri] container started");
            resp.container_ids.push(container_id);
        }
        Ok(resp)
    }
}

fn step_error(index: usize, stage: &'static str, source: CriError) -> CriError {
    CriError::RunContainers {
        index,
        stage,
        source: Box::new(source),
    }
}
