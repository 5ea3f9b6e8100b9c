use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use clap::{Args, Subcommand};
use common::{Pod, PodStatus};
use libruntime::cri::Cri;
use serde::Serialize;
use tracing::info;

use crate::{
    config::{Config, resolve_config},
    daemon::{
        self,
        lifecycle::{ExecAction, Handler, HookOutput, HookRunner},
        status::pod::{Runtime, RuntimeManager},
    },
};

#[derive(Args, Debug, Clone, Default)]
pub struct RuntimeArgs {
    #[arg(long, value_name = "FILE", env = "RKL_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "ENDPOINT", env = "RKL_RUNTIME_ENDPOINT")]
    pub endpoint: Option<String>,
}

impl RuntimeArgs {
    pub fn resolve(&self) -> anyhow::Result<Config> {
        resolve_config(self.config.as_deref(), self.endpoint.as_deref())
    }
}

#[derive(Subcommand, Debug)]
pub enum NodeCommand {
    #[command(about = "Run the pod lifecycle event generator until Ctrl-C")]
    Daemon {
        #[clap(flatten)]
        runtime: RuntimeArgs,
    },

    #[command(flatten)]
    Runtime(RuntimeCommand),
}

/// One-shot queries and actions against the container runtime.
#[derive(Subcommand, Debug)]
pub enum RuntimeCommand {
    #[command(about = "Print the container runtime version")]
    Version {
        #[clap(flatten)]
        runtime: RuntimeArgs,
    },

    #[command(about = "List pods known to the container runtime as JSON")]
    Pods {
        #[arg(long, help = "Include not-ready sandboxes and stopped containers")]
        all: bool,

        #[clap(flatten)]
        runtime: RuntimeArgs,
    },

    #[command(about = "Print the status of one pod as JSON")]
    Status {
        #[arg(value_name = "POD_UID")]
        uid: String,

        #[arg(long, default_value = "")]
        name: String,

        #[arg(long, default_value = "default")]
        namespace: String,

        #[clap(flatten)]
        runtime: RuntimeArgs,
    },

    #[command(about = "Run a lifecycle hook inside a container")]
    ExecHook {
        #[arg(value_name = "CONTAINER_ID")]
        container_id: String,

        #[arg(
            long,
            value_name = "FILE",
            conflicts_with = "command",
            help = "YAML handler descriptor, e.g. `exec: {command: [...]}`"
        )]
        handler: Option<PathBuf>,

        #[arg(long, default_value_t = 0, help = "Timeout in seconds, 0 for none")]
        timeout: i64,

        #[arg(
            last = true,
            required_unless_present = "handler",
            value_name = "COMMAND"
        )]
        command: Vec<String>,

        #[clap(flatten)]
        runtime: RuntimeArgs,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub version: String,
    pub runtime_name: String,
    pub runtime_version: String,
    pub runtime_api_version: String,
}

pub async fn runtime_version(cri: &dyn Cri) -> anyhow::Result<VersionInfo> {
    let resp = cri
        .version()
        .await
        .context("failed to query runtime version")?;
    Ok(VersionInfo {
        version: resp.version,
        runtime_name: resp.runtime_name,
        runtime_version: resp.runtime_version,
        runtime_api_version: resp.runtime_api_version,
    })
}

pub async fn list_pods(runtime: &dyn Runtime, all: bool) -> anyhow::Result<Vec<Pod>> {
    runtime.get_pods(all).await
}

pub async fn pod_status(
    runtime: &dyn Runtime,
    uid: &str,
    name: &str,
    namespace: &str,
) -> anyhow::Result<PodStatus> {
    runtime.get_pod_status(uid, name, namespace).await
}

pub async fn exec_hook(
    cri: Arc<dyn Cri>,
    container_id: &str,
    command: Vec<String>,
    timeout: i64,
) -> anyhow::Result<HookOutput> {
    let handler = Handler::Exec(ExecAction {
        command,
        timeout_seconds: timeout,
    });
    run_hook(cri, container_id, &handler).await
}

pub async fn run_hook(
    cri: Arc<dyn Cri>,
    container_id: &str,
    handler: &Handler,
) -> anyhow::Result<HookOutput> {
    let output = HookRunner::new(cri)
        .run(container_id, handler)
        .await
        .with_context(|| {
            format!(
                "{} hook failed in container {container_id}",
                handler.handler_type()
            )
        })?;
    Ok(output)
}

pub fn load_handler(path: &Path) -> anyhow::Result<Handler> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read hook handler from {}", path.display()))?;
    Handler::from_yaml(&raw)
        .with_context(|| format!("Failed to parse hook handler in {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn node_execute(cmd: NodeCommand) -> anyhow::Result<()> {
    match cmd {
        NodeCommand::Daemon { runtime } => daemon::main(runtime.resolve()?),
        NodeCommand::Runtime(cmd) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(runtime_execute(cmd)),
    }
}

async fn runtime_execute(cmd: RuntimeCommand) -> anyhow::Result<()> {
    match cmd {
        RuntimeCommand::Version { runtime } => {
            let cri = daemon::connect(&runtime.resolve()?).await?;
            print_json(&runtime_version(cri.as_ref()).await?)
        }
        RuntimeCommand::Pods { all, runtime } => {
            let cri = daemon::connect(&runtime.resolve()?).await?;
            let manager = RuntimeManager::try_new(cri).await?;
            print_json(&list_pods(&manager, all).await?)
        }
        RuntimeCommand::Status {
            uid,
            name,
            namespace,
            runtime,
        } => {
            let cri = daemon::connect(&runtime.resolve()?).await?;
            let manager = RuntimeManager::try_new(cri).await?;
            print_json(&pod_status(&manager, &uid, &name, &namespace).await?)
        }
        RuntimeCommand::ExecHook {
            container_id,
            handler,
            timeout,
            command,
            runtime,
        } => {
            let handler = handler.as_deref().map(load_handler).transpose()?;
            let cri = daemon::connect(&runtime.resolve()?).await?;
            let output = match handler {
                Some(handler) => run_hook(cri, &container_id, &handler).await?,
                None => exec_hook(cri, &container_id, command, timeout).await?,
            };
            info!(container_id = %container_id, "[lifecycle] hook succeeded");
            print!("{}", output.stdout);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(subcommand)]
        command: NodeCommand,
    }

    fn parse(args: &[&str]) -> NodeCommand {
        TestCli::try_parse_from(std::iter::once("rkl").chain(args.iter().copied()))
            .unwrap()
            .command
    }

    #[test]
    fn daemon_and_runtime_commands_parse_side_by_side() {
        assert!(matches!(parse(&["daemon"]), NodeCommand::Daemon { .. }));
        assert!(matches!(
            parse(&["pods", "--all"]),
            NodeCommand::Runtime(RuntimeCommand::Pods { all: true, .. })
        ));
        match parse(&["status", "u1", "--name", "web"]) {
            NodeCommand::Runtime(RuntimeCommand::Status {
                uid,
                name,
                namespace,
                ..
            }) => {
                assert_eq!(uid, "u1");
                assert_eq!(name, "web");
                assert_eq!(namespace, "default");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn exec_hook_takes_a_command_or_a_handler_file() {
        match parse(&["exec-hook", "c1", "--", "/bin/sh", "-c", "true"]) {
            NodeCommand::Runtime(RuntimeCommand::ExecHook {
                handler, command, ..
            }) => {
                assert!(handler.is_none());
                assert_eq!(command, vec!["/bin/sh", "-c", "true"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(matches!(
            parse(&["exec-hook", "c1", "--handler", "hook.yaml"]),
            NodeCommand::Runtime(RuntimeCommand::ExecHook { handler: Some(_), .. })
        ));

        let err = |args: &[&str]| {
            TestCli::try_parse_from(std::iter::once("rkl").chain(args.iter().copied())).is_err()
        };
        assert!(err(&["exec-hook", "c1"]));
        assert!(err(&["exec-hook", "c1", "--handler", "hook.yaml", "--", "true"]));
    }

    #[test]
    fn load_handler_reads_yaml_descriptors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"exec:\n  command: [\"echo\", \"hi\"]\n  timeoutSeconds: 3\n")
            .unwrap();
        let handler = load_handler(file.path()).unwrap();
        assert_eq!(
            handler,
            Handler::Exec(ExecAction {
                command: vec!["echo".to_string(), "hi".to_string()],
                timeout_seconds: 3,
            })
        );

        assert!(load_handler(Path::new("/definitely/not/here.yaml")).is_err());
    }
}
