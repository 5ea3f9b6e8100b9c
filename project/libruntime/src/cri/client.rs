//! gRPC implementation of [`Cri`] on top of tonic.

use std::{future::Future, path::PathBuf, time::Duration};

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info};

use super::{
    Cri, CriError, ListContainerOptions, ListPodOptions,
    cri_api::{
        Container, ContainerConfig, ContainerStatusRequest, ContainerStatusResponse,
        CreateContainerRequest, ExecSyncRequest, ExecSyncResponse, Image, ImageFilter,
        ImageStatusRequest, ImageStatusResponse, ListContainersRequest, ListImagesRequest,
        ListPodSandboxRequest, PodSandbox, PodSandboxConfig, PodSandboxStatusRequest,
        PodSandboxStatusResponse, PullImageRequest, PullImageResponse, RemoveContainerRequest,
        RemovePodSandboxRequest, RunPodSandboxRequest, StartContainerRequest,
        StopContainerRequest, StopPodSandboxRequest, VersionRequest, VersionResponse,
        image_service_client::ImageServiceClient, runtime_service_client::RuntimeServiceClient,
    },
};

/// CRI API version sent with `Version` requests.
pub const CRI_API_VERSION: &str = "v1";
pub const DEFAULT_ENDPOINT: &str = "unix:///run/containerd/containerd.sock";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Container statuses can be large, the gRPC default of 4 MiB is not enough.
pub const MIN_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Where the runtime listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CriEndpoint {
    Unix(PathBuf),
    Http(String),
}

impl CriEndpoint {
    /// Accepts `unix:///path`, a bare absolute path, or an `http(s)://` URI.
    pub fn parse(endpoint: &str) -> Result<Self, CriError> {
        let endpoint = endpoint.trim();
        if let Some(path) = endpoint.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(CriError::InvalidEndpoint(endpoint.to_string()));
            }
            return Ok(CriEndpoint::Unix(PathBuf::from(path)));
        }
        if endpoint.starts_with('/') {
            return Ok(CriEndpoint::Unix(PathBuf::from(endpoint)));
        }
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Ok(CriEndpoint::Http(endpoint.to_string()));
        }
        Err(CriError::InvalidEndpoint(endpoint.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct CriClientConfig {
    pub endpoint: String,
    /// Deadline applied to every request.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Raised to at least [`MIN_MAX_MESSAGE_SIZE`].
    pub max_message_size: usize,
}

impl Default for CriClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_TIMEOUT,
            max_message_size: MIN_MAX_MESSAGE_SIZE,
        }
    }
}

/// CRI client over one multiplexed gRPC channel.
///
/// Cloning is cheap and clones share the channel, so the client can be used
/// from many tasks at once. Every call is bounded by the configured deadline
/// and aborts early once the cancellation token fires.
#[derive(Debug, Clone)]
pub struct CriClient {
    endpoint: String,
    timeout: Duration,
    runtime: RuntimeServiceClient<Channel>,
    image: ImageServiceClient<Channel>,
    cancel: CancellationToken,
}

impl CriClient {
    pub async fn connect(config: CriClientConfig) -> Result<Self, CriError> {
        let target = CriEndpoint::parse(&config.endpoint)?;
        debug!(endpoint = %config.endpoint, ?target, "[cri] connecting to runtime");

        let channel = tokio::time::timeout(config.connect_timeout, dial(target, &config))
            .await
            .map_err(|_| CriError::Timeout {
                op: "Connect",
                timeout: config.connect_timeout,
            })??;

        info!(endpoint = %config.endpoint, "[cri] connected to runtime");
        Ok(Self::from_channel(channel, &config))
    }

    /// Wraps an already established channel.
    pub fn from_channel(channel: Channel, config: &CriClientConfig) -> Self {
        let max = config.max_message_size.max(MIN_MAX_MESSAGE_SIZE);
        Self {
            endpoint: config.endpoint.clone(),
            timeout: config.timeout,
            runtime: RuntimeServiceClient::new(channel.clone())
                .max_decoding_message_size(max)
                .max_encoding_message_size(max),
            image: ImageServiceClient::new(channel)
                .max_decoding_message_size(max)
                .max_encoding_message_size(max),
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the token that aborts in-flight and future calls.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut req = tonic::Request::new(message);
        req.set_timeout(self.timeout);
        req
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, CriError>
    where
        F: Future<Output = Result<tonic::Response<T>, tonic::Status>>,
    {
        with_deadline(op, Some(self.timeout), &self.cancel, fut)
            .await
            .map(tonic::Response::into_inner)
    }
}

async fn dial(target: CriEndpoint, config: &CriClientConfig) -> Result<Channel, CriError> {
    let to_connect_error = |source: tonic::transport::Error| CriError::Connect {
        endpoint: config.endpoint.clone(),
        source,
    };
    match target {
        CriEndpoint::Unix(path) => {
            // the uri is a placeholder, the connector ignores it
            Endpoint::from_static("http://[::]:50051")
                .connect_timeout(config.connect_timeout)
                .connect_with_connector(service_fn(move |_: Uri| {
                    let path = path.clone();
                    async move {
                        let stream = UnixStream::connect(path).await?;
                        Ok::<_, std::io::Error>(TokioIo::new(stream))
                    }
                }))
                .await
                .map_err(to_connect_error)
        }
        CriEndpoint::Http(uri) => Endpoint::from_shared(uri)
            .map_err(to_connect_error)?
            .connect_timeout(config.connect_timeout)
            .connect()
            .await
            .map_err(to_connect_error),
    }
}

/// Runs one RPC, bounded by `timeout` when set and abandoned when `cancel`
/// fires.
pub(crate) async fn with_deadline<T, F>(
    op: &'static str,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, CriError>
where
    F: Future<Output = Result<T, tonic::Status>>,
{
    let bounded = async {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| CriError::Timeout { op, timeout }),
            None => Ok(fut.await),
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CriError::Cancelled { op }),
        res = bounded => match res {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(CriError::Status { op, source }),
            Err(e) => Err(e),
        },
    }
}

/// Client-side bound of an `ExecSync` call: the command timeout plus the
/// request timeout. A zero timeout means no limit, so only cancellation
/// ends the call.
fn exec_deadline(request_timeout: Duration, timeout: i64) -> Option<Duration> {
    (timeout > 0).then(|| request_timeout + Duration::from_secs(timeout as u64))
}

#[async_trait]
impl Cri for CriClient {
    async fn version(&self) -> Result<VersionResponse, CriError> {
        let mut client = self.runtime.clone();
        let req = self.request(VersionRequest {
            version: CRI_API_VERSION.to_string(),
        });
        self.call("Version", client.version(req)).await
    }

    async fn list_pods(&self, opts: ListPodOptions) -> Result<Vec<PodSandbox>, CriError> {
        let mut client = self.runtime.clone();
        let req = self.request(ListPodSandboxRequest {
            filter: Some(opts.to_filter()),
        });
        let resp = self.call("ListPodSandbox", client.list_pod_sandbox(req)).await?;
        Ok(resp.items)
    }

    async fn list_containers(
        &self,
        opts: ListContainerOptions,
    ) -> Result<Vec<Container>, CriError> {
        let mut client = self.runtime.clone();
        let req = self.request(ListContainersRequest {
            filter: Some(opts.to_filter()),
        });
        let resp = self.call("ListContainers", client.list_containers(req)).await?;
        Ok(resp.containers)
    }

    async fn pod_sandbox_status(
        &self,
        pod_id: &str,
        verbose: bool,
    ) -> Result<PodSandboxStatusResponse, CriError> {
        let mut client = self.runtime.clone();
        let req = self.request(PodSandboxStatusRequest {
            pod_sandbox_id: pod_id.to_string(),
            verbose,
        });
        self.call("PodSandboxStatus", client.pod_sandbox_status(req))
            .await
    }

    async fn container_status(
        &self,
        container_id: &str,
        verbose: bool,
    ) -> Result<ContainerStatusResponse, CriError> {
        let mut client = self.runtime.clone();
        let req = self.request(ContainerStatusRequest {
            container_id: container_id.to_string(),
            verbose,
        });
        self.call("ContainerStatus", client.container_status(req))
            .await
    }

    async fn run_pod_sandbox(
        &self,
        config: PodSandboxConfig,
        runtime_handler: &str,
    ) -> Result<String, CriError> {
        let mut client = self.runtime.clone();
        let req = self.request(RunPodSandboxRequest {
            config: Some(config),
            runtime_handler: runtime_handler.to_string(),
        });
        debug!(runtime_handler, "[cri] RunPodSandbox");
        let resp = self.call("RunPodSandbox", client.run_pod_sandbox(req)).await?;
        if resp.pod_sandbox_id.is_empty() {
            return Err(CriError::EmptyResponse {
                op: "RunPodSandbox",
                field: "pod_sandbox_id",
            });
        }
        Ok(resp.pod_sandbox_id)
    }

    async fn stop_pod_sandbox(&self, req: StopPodSandboxRequest) -> Result<(), CriError> {
        let mut client = self.runtime.clone();
        let req = self.request(req);
        self.call("StopPodSandbox", client.stop_pod_sandbox(req))
            .await?;
        Ok(())
    }

    async fn remove_pod_sandbox(&self, pod_id: &str) -> Result<(), CriError> {
        let mut client = self.runtime.clone();
        let req = self.request(RemovePodSandboxRequest {
            pod_sandbox_id: pod_id.to_string(),
        });
        self.call("RemovePodSandbox", client.remove_pod_sandbox(req))
            .await?;
        Ok(())
    }

    async fn create_container(
        &self,
        pod_id: &str,
        pod_config: &PodSandboxConfig,
        config: ContainerConfig,
    ) -> Result<String, CriError> {
        let mut client = self.runtime.clone();
        let req = self.request(CreateContainerRequest {
            pod_sandbox_id: pod_id.to_string(),
            config: Some(config),
            sandbox_config: Some(pod_config.clone()),
        });
        debug!(pod_id, "[cri] CreateContainer");
        let resp = self
            .call("CreateContainer", client.create_container(req))
            .await?;
        if resp.container_id.is_empty() {
            return Err(CriError::EmptyResponse {
                op: "CreateContainer",
                field: "container_id",
            });
        }
        Ok(resp.container_id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), CriError> {
        if container_id.is_empty() {
            return Err(CriError::InvalidArgument {
                op: "StartContainer",
                reason: "container id can't be empty".to_string(),
            });
        }
        let mut client = self.runtime.clone();
        let req = self.request(StartContainerRequest {
            container_id: container_id.to_string(),
        });
        self.call("StartContainer", client.start_container(req))
            .await?;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, timeout: i64) -> Result<(), CriError> {
        let mut client = self.runtime.clone();
        let req = self.request(StopContainerRequest {
            container_id: container_id.to_string(),
            timeout,
        });
        self.call("StopContainer", client.stop_container(req))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), CriError> {
        let mut client = self.runtime.clone();
        let req = self.request(RemoveContainerRequest {
            container_id: container_id.to_string(),
        });
        self.call("RemoveContainer", client.remove_container(req))
            .await?;
        Ok(())
    }

    async fn list_images(&self, filter: Option<ImageFilter>) -> Result<Vec<Image>, CriError> {
        let mut client = self.image.clone();
        let req = self.request(ListImagesRequest { filter });
        let resp = self.call("ListImages", client.list_images(req)).await?;
        Ok(resp.images)
    }

    async fn pull_image(&self, req: PullImageRequest) -> Result<PullImageResponse, CriError> {
        let mut client = self.image.clone();
        let req = self.request(req);
        self.call("PullImage", client.pull_image(req)).await
    }

    async fn image_status(
        &self,
        req: ImageStatusRequest,
    ) -> Result<ImageStatusResponse, CriError> {
        let mut client = self.image.clone();
        let req = self.request(req);
        self.call("ImageStatus", client.image_status(req)).await
    }

    async fn exec_sync(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        timeout: i64,
    ) -> Result<ExecSyncResponse, CriError> {
        let mut client = self.runtime.clone();
        let mut req = tonic::Request::new(ExecSyncRequest {
            container_id: container_id.to_string(),
            cmd,
            timeout,
        });
        let deadline = exec_deadline(self.timeout, timeout);
        if let Some(deadline) = deadline {
            req.set_timeout(deadline);
        }
        with_deadline("ExecSync", deadline, &self.cancel, client.exec_sync(req))
            .await
            .map(tonic::Response::into_inner)
    }
}
