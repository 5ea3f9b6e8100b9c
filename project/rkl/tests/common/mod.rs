#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use ::common::labels::{
    CONTAINER_NAME_ANNOTATION, CONTAINER_NAME_LABEL, CONTAINER_RESTART_COUNT_ANNOTATION,
    SANDBOX_ID_ANNOTATION, SANDBOX_NAME_ANNOTATION, SANDBOX_NAMESPACE_ANNOTATION,
    SANDBOX_UID_ANNOTATION, new_pod_labels,
};
use libruntime::cri::{
    Cri, CriError, ListContainerOptions, ListPodOptions,
    cri_api::{
        Container, ContainerConfig, ContainerMetadata, ContainerState, ContainerStatus,
        ContainerStatusResponse, ExecSyncResponse, Image, ImageFilter, ImageSpec,
        ImageStatusRequest, ImageStatusResponse, PodIp, PodSandbox, PodSandboxConfig,
        PodSandboxMetadata, PodSandboxNetworkStatus, PodSandboxState, PodSandboxStatus,
        PodSandboxStatusResponse, PullImageRequest, PullImageResponse, StopPodSandboxRequest,
        VersionResponse,
    },
};

pub const RUNTIME_NAME: &str = "fakeruntime";

#[derive(Debug, Clone)]
pub struct FakeSandbox {
    pub id: String,
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub ready: bool,
    pub created_at: i64,
    pub ip: String,
    pub additional_ips: Vec<String>,
    pub labeled: bool,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub sandbox_id: String,
    pub uid: String,
    pub pod_name: String,
    pub namespace: String,
    pub name: String,
    pub state: ContainerState,
    pub created_at: i64,
    pub restart_count: Option<String>,
    /// No pod labels; identity only in the verbose runtime-spec annotations.
    pub legacy: bool,
}

#[derive(Debug, Clone)]
pub struct ExecCall {
    pub container_id: String,
    pub cmd: Vec<String>,
    pub timeout: i64,
}

#[derive(Default)]
pub struct FakeState {
    pub sandboxes: Vec<FakeSandbox>,
    pub containers: Vec<FakeContainer>,
    pub fail_list: bool,
    pub fail_container_status: bool,
    pub exec_response: ExecSyncResponse,
    pub exec_error: bool,
    pub exec_calls: Vec<ExecCall>,
}

/// In-memory container runtime.
#[derive(Default, Clone)]
pub struct FakeCri {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCri {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_sandbox(&self, id: &str, uid: &str, name: &str, ip: &str, created_at: i64) {
        self.state().sandboxes.push(FakeSandbox {
            id: id.to_string(),
            uid: uid.to_string(),
            name: name.to_string(),
            namespace: "default".to_string(),
            ready: true,
            created_at,
            ip: ip.to_string(),
            additional_ips: Vec::new(),
            labeled: true,
        });
    }

    pub fn sandbox_mut<R>(&self, id: &str, f: impl FnOnce(&mut FakeSandbox) -> R) -> R {
        let mut state = self.state();
        let sandbox = state
            .sandboxes
            .iter_mut()
            .find(|s| s.id == id)
            .expect("unknown sandbox");
        f(sandbox)
    }

    pub fn remove_sandbox(&self, id: &str) {
        self.state().sandboxes.retain(|s| s.id != id);
    }

    pub fn add_container(
        &self,
        id: &str,
        sandbox_id: &str,
        name: &str,
        state: ContainerState,
        created_at: i64,
    ) {
        let mut fake = self.state();
        let sandbox = fake
            .sandboxes
            .iter()
            .find(|s| s.id == sandbox_id)
            .cloned()
            .expect("unknown sandbox");
        fake.containers.push(FakeContainer {
            id: id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            uid: sandbox.uid,
            pod_name: sandbox.name,
            namespace: sandbox.namespace,
            name: name.to_string(),
            state,
            created_at,
            restart_count: None,
            legacy: false,
        });
    }

    pub fn container_mut<R>(&self, id: &str, f: impl FnOnce(&mut FakeContainer) -> R) -> R {
        let mut state = self.state();
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .expect("unknown container");
        f(container)
    }

    pub fn set_container_state(&self, id: &str, state: ContainerState) {
        self.container_mut(id, |c| c.state = state);
    }

    pub fn remove_container(&self, id: &str) {
        self.state().containers.retain(|c| c.id != id);
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.state().exec_calls.clone()
    }

    fn sandbox_state(sandbox: &FakeSandbox) -> PodSandboxState {
        if sandbox.ready {
            PodSandboxState::SandboxReady
        } else {
            PodSandboxState::SandboxNotready
        }
    }

    fn sandbox_labels(sandbox: &FakeSandbox) -> HashMap<String, String> {
        if sandbox.labeled {
            new_pod_labels(&sandbox.name, &sandbox.namespace, &sandbox.uid)
        } else {
            HashMap::new()
        }
    }

    fn metadata(sandbox: &FakeSandbox) -> PodSandboxMetadata {
        PodSandboxMetadata {
            name: sandbox.name.clone(),
            uid: sandbox.uid.clone(),
            namespace: sandbox.namespace.clone(),
            attempt: 0,
        }
    }

    fn container_labels(container: &FakeContainer) -> HashMap<String, String> {
        if container.legacy {
            return HashMap::new();
        }
        let mut labels = new_pod_labels(&container.pod_name, &container.namespace, &container.uid);
        labels.insert(CONTAINER_NAME_LABEL.to_string(), container.name.clone());
        labels
    }

    fn container_annotations(container: &FakeContainer) -> HashMap<String, String> {
        let mut annotations = HashMap::new();
        if let Some(count) = &container.restart_count {
            annotations.insert(CONTAINER_RESTART_COUNT_ANNOTATION.to_string(), count.clone());
        }
        annotations
    }

    fn to_cri_container(container: &FakeContainer) -> Container {
        Container {
            id: container.id.clone(),
            pod_sandbox_id: container.sandbox_id.clone(),
            metadata: Some(ContainerMetadata {
                name: container.name.clone(),
                attempt: 0,
            }),
            image: Some(ImageSpec {
                image: "nginx:1.27".to_string(),
                ..Default::default()
            }),
            image_ref: "sha256:nginx".to_string(),
            state: container.state as i32,
            created_at: container.created_at,
            labels: Self::container_labels(container),
            annotations: Self::container_annotations(container),
            ..Default::default()
        }
    }

    fn verbose_info(container: &FakeContainer) -> String {
        serde_json::json!({
            "sandboxID": container.sandbox_id,
            "runtimeSpec": {
                "annotations": {
                    SANDBOX_ID_ANNOTATION: container.sandbox_id,
                    SANDBOX_NAME_ANNOTATION: container.pod_name,
                    SANDBOX_NAMESPACE_ANNOTATION: container.namespace,
                    SANDBOX_UID_ANNOTATION: container.uid,
                    CONTAINER_NAME_ANNOTATION: container.name,
                }
            }
        })
        .to_string()
    }
}

fn labels_match(selector: &HashMap<String, String>, labels: &HashMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

fn unsupported(op: &'static str) -> CriError {
    CriError::InvalidArgument {
        op,
        reason: "not implemented by FakeCri".to_string(),
    }
}

#[async_trait]
impl Cri for FakeCri {
    async fn version(&self) -> Result<VersionResponse, CriError> {
        Ok(VersionResponse {
            version: "0.1.0".to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: "1.0.0".to_string(),
            runtime_api_version: "v1".to_string(),
        })
    }

    async fn list_pods(&self, opts: ListPodOptions) -> Result<Vec<PodSandbox>, CriError> {
        let state = self.state();
        if state.fail_list {
            return Err(CriError::status(
                "ListPodSandbox",
                tonic::Status::unavailable("runtime is down"),
            ));
        }
        Ok(state
            .sandboxes
            .iter()
            .filter(|s| opts.id.as_ref().is_none_or(|id| *id == s.id))
            .filter(|s| opts.state.is_none_or(|st| st == Self::sandbox_state(s)))
            .filter(|s| labels_match(&opts.labels, &Self::sandbox_labels(s)))
            .map(|s| PodSandbox {
                id: s.id.clone(),
                metadata: Some(Self::metadata(s)),
                state: Self::sandbox_state(s) as i32,
                created_at: s.created_at,
                labels: Self::sandbox_labels(s),
                ..Default::default()
            })
            .collect())
    }

    async fn list_containers(
        &self,
        opts: ListContainerOptions,
    ) -> Result<Vec<Container>, CriError> {
        let state = self.state();
        if state.fail_list {
            return Err(CriError::status(
                "ListContainers",
                tonic::Status::unavailable("runtime is down"),
            ));
        }
        Ok(state
            .containers
            .iter()
            .filter(|c| opts.id.as_ref().is_none_or(|id| *id == c.id))
            .filter(|c| opts.pod_id.as_ref().is_none_or(|id| *id == c.sandbox_id))
            .filter(|c| opts.state.is_none_or(|st| st == c.state))
            .filter(|c| labels_match(&opts.labels, &Self::container_labels(c)))
            .map(Self::to_cri_container)
            .collect())
    }

    async fn pod_sandbox_status(
        &self,
        pod_id: &str,
        _verbose: bool,
    ) -> Result<PodSandboxStatusResponse, CriError> {
        let state = self.state();
        let Some(sandbox) = state.sandboxes.iter().find(|s| s.id == pod_id) else {
            return Err(CriError::not_found("PodSandboxStatus", pod_id));
        };
        Ok(PodSandboxStatusResponse {
            status: Some(PodSandboxStatus {
                id: sandbox.id.clone(),
                metadata: Some(Self::metadata(sandbox)),
                state: Self::sandbox_state(sandbox) as i32,
                created_at: sandbox.created_at,
                network: Some(PodSandboxNetworkStatus {
                    ip: sandbox.ip.clone(),
                    additional_ips: sandbox
                        .additional_ips
                        .iter()
                        .map(|ip| PodIp { ip: ip.clone() })
                        .collect(),
                }),
                labels: Self::sandbox_labels(sandbox),
                ..Default::default()
            }),
            info: HashMap::new(),
        })
    }

    async fn container_status(
        &self,
        container_id: &str,
        verbose: bool,
    ) -> Result<ContainerStatusResponse, CriError> {
        let state = self.state();
        if state.fail_container_status {
            return Err(CriError::status(
                "ContainerStatus",
                tonic::Status::unavailable("runtime is busy"),
            ));
        }
        let Some(container) = state.containers.iter().find(|c| c.id == container_id) else {
            return Err(CriError::not_found("ContainerStatus", container_id));
        };
        let mut info = HashMap::new();
        if verbose {
            info.insert("info".to_string(), Self::verbose_info(container));
        }
        Ok(ContainerStatusResponse {
            status: Some(ContainerStatus {
                id: container.id.clone(),
                metadata: Some(ContainerMetadata {
                    name: container.name.clone(),
                    attempt: 0,
                }),
                state: container.state as i32,
                created_at: container.created_at,
                started_at: container.created_at + 1,
                finished_at: container.created_at + 2,
                exit_code: if container.state == ContainerState::ContainerExited {
                    1
                } else {
                    0
                },
                image: Some(ImageSpec {
                    image: "nginx:1.27".to_string(),
                    ..Default::default()
                }),
                image_ref: "sha256:nginx".to_string(),
                labels: Self::container_labels(container),
                annotations: Self::container_annotations(container),
                ..Default::default()
            }),
            info,
        })
    }

    async fn run_pod_sandbox(
        &self,
        _config: PodSandboxConfig,
        _runtime_handler: &str,
    ) -> Result<String, CriError> {
        Err(unsupported("RunPodSandbox"))
    }

    async fn stop_pod_sandbox(&self, _req: StopPodSandboxRequest) -> Result<(), CriError> {
        Err(unsupported("StopPodSandbox"))
    }

    async fn remove_pod_sandbox(&self, _pod_id: &str) -> Result<(), CriError> {
        Err(unsupported("RemovePodSandbox"))
    }

    async fn create_container(
        &self,
        _pod_id: &str,
        _pod_config: &PodSandboxConfig,
        _config: ContainerConfig,
    ) -> Result<String, CriError> {
        Err(unsupported("CreateContainer"))
    }

    async fn start_container(&self, _container_id: &str) -> Result<(), CriError> {
        Err(unsupported("StartContainer"))
    }

    async fn stop_container(&self, _container_id: &str, _timeout: i64) -> Result<(), CriError> {
        Err(unsupported("StopContainer"))
    }

    async fn remove_container(&self, _container_id: &str) -> Result<(), CriError> {
        Err(unsupported("RemoveContainer"))
    }

    async fn list_images(&self, _filter: Option<ImageFilter>) -> Result<Vec<Image>, CriError> {
        Ok(Vec::new())
    }

    async fn pull_image(&self, _req: PullImageRequest) -> Result<PullImageResponse, CriError> {
        Err(unsupported("PullImage"))
    }

    async fn image_status(
        &self,
        _req: ImageStatusRequest,
    ) -> Result<ImageStatusResponse, CriError> {
        Err(unsupported("ImageStatus"))
    }

    async fn exec_sync(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        timeout: i64,
    ) -> Result<ExecSyncResponse, CriError> {
        let mut state = self.state();
        state.exec_calls.push(ExecCall {
            container_id: container_id.to_string(),
            cmd,
            timeout,
        });
        if state.exec_error {
            return Err(CriError::status(
                "ExecSync",
                tonic::Status::unavailable("runtime is down"),
            ));
        }
        if !state.containers.iter().any(|c| c.id == container_id) {
            return Err(CriError::not_found("ExecSync", container_id));
        }
        Ok(state.exec_response.clone())
    }
}
