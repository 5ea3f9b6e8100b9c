//! Container lifecycle hooks (post-start / pre-stop handlers).
//!
//! A [`Handler`] describes what to run; a [`Lifecycle`] implementation knows
//! how to run one kind of handler. [`HookRunner`] dispatches a handler to the
//! implementation registered for its [`HandlerType`]. Only exec handlers are
//! built in: the command runs inside the container through CRI `ExecSync` and
//! must exit with status zero.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use libruntime::cri::{Cri, CriError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Handler {
    Exec(ExecAction),
    HttpGet(HttpGetAction),
    TcpSocket(TcpSocketAction),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecAction {
    pub command: Vec<String>,
    /// Forwarded to the runtime; zero means no limit.
    #[serde(default)]
    pub timeout_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpGetAction {
    #[serde(default)]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpSocketAction {
    #[serde(default)]
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerType {
    Exec,
    HttpGet,
    TcpSocket,
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerType::Exec => "exec",
            HandlerType::HttpGet => "httpGet",
            HandlerType::TcpSocket => "tcpSocket",
        };
        f.write_str(name)
    }
}

impl Handler {
    /// Parses a Kubernetes-shaped descriptor, e.g.
    /// `exec: {command: ["/bin/sh", "-c", "echo ready"]}`.
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::with::singleton_map::deserialize(serde_yaml::Deserializer::from_str(raw))
    }

    pub fn handler_type(&self) -> HandlerType {
        match self {
            Handler::Exec(_) => HandlerType::Exec,
            Handler::HttpGet(_) => HandlerType::HttpGet,
            Handler::TcpSocket(_) => HandlerType::TcpSocket,
        }
    }
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("unsupported lifecycle handler type {0}")]
    Unsupported(HandlerType),

    #[error("{expected} handler cannot run a {got} hook")]
    MismatchedHandler {
        expected: HandlerType,
        got: HandlerType,
    },

    #[error("exec hook command cannot be empty")]
    EmptyCommand,

    #[error("exec hook in container {container_id} exited with {exit_code}: {stderr}")]
    ExecFailed {
        container_id: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error(transparent)]
    Cri(#[from] CriError),
}

/// Output of a successful hook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs one kind of lifecycle handler.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn handler_type(&self) -> HandlerType;

    async fn run(
        &self,
        handler: &Handler,
        cri: &dyn Cri,
        container_id: &str,
    ) -> Result<HookOutput, LifecycleError>;
}

/// Runs the command inside the container with `ExecSync`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecHandler;

#[async_trait]
impl Lifecycle for ExecHandler {
    fn handler_type(&self) -> HandlerType {
        HandlerType::Exec
    }

    async fn run(
        &self,
        handler: &Handler,
        cri: &dyn Cri,
        container_id: &str,
    ) -> Result<HookOutput, LifecycleError> {
        let Handler::Exec(action) = handler else {
            return Err(LifecycleError::MismatchedHandler {
                expected: HandlerType::Exec,
                got: handler.handler_type(),
            });
        };
        if action.command.is_empty() {
            return Err(LifecycleError::EmptyCommand);
        }

        debug!(
            container_id,
            command = ?action.command,
            "[lifecycle] Running exec hook"
        );
        let resp = cri
            .exec_sync(container_id, action.command.clone(), action.timeout_seconds)
            .await?;
        let stdout = String::from_utf8_lossy(&resp.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&resp.stderr).into_owned();
        if resp.exit_code != 0 {
            return Err(LifecycleError::ExecFailed {
                container_id: container_id.to_string(),
                exit_code: resp.exit_code,
                stdout,
                stderr,
            });
        }
        Ok(HookOutput { stdout, stderr })
    }
}

/// Lifecycle implementations keyed by the handler type they run.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerType, Arc<dyn Lifecycle>>,
}

impl HandlerRegistry {
    /// Registry with the built-in exec handler.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(ExecHandler));
        registry
    }

    /// Registers `handler` for its type, returning the one it replaces.
    pub fn register(&mut self, handler: Arc<dyn Lifecycle>) -> Option<Arc<dyn Lifecycle>> {
        self.handlers.insert(handler.handler_type(), handler)
    }

    pub fn lookup(&self, handler_type: HandlerType) -> Result<Arc<dyn Lifecycle>, LifecycleError> {
        self.handlers
            .get(&handler_type)
            .cloned()
            .ok_or(LifecycleError::Unsupported(handler_type))
    }
}

/// Runs lifecycle hooks against containers of one runtime.
#[derive(Clone)]
pub struct HookRunner {
    cri: Arc<dyn Cri>,
    registry: HandlerRegistry,
}

impl HookRunner {
    pub fn new(cri: Arc<dyn Cri>) -> Self {
        Self::with_registry(cri, HandlerRegistry::with_defaults())
    }

    pub fn with_registry(cri: Arc<dyn Cri>, registry: HandlerRegistry) -> Self {
        Self { cri, registry }
    }

    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    pub async fn run(
        &self,
        container_id: &str,
        handler: &Handler,
    ) -> Result<HookOutput, LifecycleError> {
        let lifecycle = self.registry.lookup(handler.handler_type())?;
        lifecycle
            .run(handler, self.cri.as_ref(), container_id)
            .await
            .inspect_err(|e| {
                warn!(
                    container_id,
                    handler_type = %handler.handler_type(),
                    error = %e,
                    "[lifecycle] Hook failed"
                );
            })
    }
}
