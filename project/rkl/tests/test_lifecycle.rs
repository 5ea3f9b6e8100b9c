mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::FakeCri;
use libruntime::cri::{Cri, cri_api::{ContainerState as CriState, ExecSyncResponse}};
use rkl::{
    commands::exec_hook,
    daemon::lifecycle::{
        ExecAction, HandlerType, Handler, HookOutput, HookRunner, HttpGetAction, Lifecycle,
        LifecycleError,
    },
};

fn running_container() -> FakeCri {
    let cri = FakeCri::new();
    cri.add_sandbox("s1", "u1", "web", "10.0.0.1", 100);
    cri.add_container("c1", "s1", "nginx", CriState::ContainerRunning, 110);
    cri
}

fn exec(cmd: &[&str]) -> Handler {
    Handler::Exec(ExecAction {
        command: cmd.iter().map(|s| s.to_string()).collect(),
        timeout_seconds: 10,
    })
}

#[tokio::test]
async fn exec_hook_succeeds_on_zero_exit() {
    let cri = running_container();
    cri.state().exec_response = ExecSyncResponse {
        stdout: b"ready\n".to_vec(),
        stderr: Vec::new(),
        exit_code: 0,
    };

    let runner = HookRunner::new(Arc::new(cri.clone()));
    let output = runner.run("c1", &exec(&["/bin/sh", "-c", "echo ready"])).await.unwrap();
    assert_eq!(output.stdout, "ready\n");

    let calls = cri.exec_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].container_id, "c1");
    assert_eq!(calls[0].cmd, vec!["/bin/sh", "-c", "echo ready"]);
    assert_eq!(calls[0].timeout, 10);
}

#[tokio::test]
async fn exec_hook_reports_non_zero_exit_with_output() {
    let cri = running_container();
    cri.state().exec_response = ExecSyncResponse {
        stdout: b"partial".to_vec(),
        stderr: b"boom".to_vec(),
        exit_code: 3,
    };

    let runner = HookRunner::new(Arc::new(cri));
    match runner.run("c1", &exec(&["false"])).await {
        Err(LifecycleError::ExecFailed {
            container_id,
            exit_code,
            stdout,
            stderr,
        }) => {
            assert_eq!(container_id, "c1");
            assert_eq!(exit_code, 3);
            assert_eq!(stdout, "partial");
            assert_eq!(stderr, "boom");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn exec_hook_surfaces_transport_errors() {
    let cri = running_container();
    cri.state().exec_error = true;
    let runner = HookRunner::new(Arc::new(cri));
    let err = runner.run("c1", &exec(&["true"])).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Cri(_)));

    let runner = HookRunner::new(Arc::new(running_container()));
    match runner.run("missing", &exec(&["true"])).await {
        Err(LifecycleError::Cri(e)) => assert!(e.is_not_found()),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn empty_command_is_rejected_before_reaching_the_runtime() {
    let cri = running_container();
    let runner = HookRunner::new(Arc::new(cri.clone()));
    let err = runner.run("c1", &exec(&[])).await.unwrap_err();
    assert!(matches!(err, LifecycleError::EmptyCommand));
    assert!(cri.exec_calls().is_empty());
}

#[tokio::test]
async fn unregistered_handler_type_is_unsupported() {
    let runner = HookRunner::new(Arc::new(running_container()));
    let handler = Handler::HttpGet(HttpGetAction {
        host: String::new(),
        port: 8080,
        path: "/ready".to_string(),
    });
    let err = runner.run("c1", &handler).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Unsupported(HandlerType::HttpGet)));
}

struct AlwaysOk;

#[async_trait]
impl Lifecycle for AlwaysOk {
    fn handler_type(&self) -> HandlerType {
        HandlerType::HttpGet
    }

    async fn run(
        &self,
        _handler: &Handler,
        _cri: &dyn Cri,
        container_id: &str,
    ) -> Result<HookOutput, LifecycleError> {
        Ok(HookOutput {
            stdout: format!("probed {container_id}"),
            stderr: String::new(),
        })
    }
}

#[tokio::test]
async fn new_handler_types_can_be_plugged_in() {
    let mut runner = HookRunner::new(Arc::new(running_container()));
    runner.registry_mut().register(Arc::new(AlwaysOk));

    let handler = Handler::HttpGet(HttpGetAction {
        host: String::new(),
        port: 8080,
        path: "/ready".to_string(),
    });
    let output = runner.run("c1", &handler).await.unwrap();
    assert_eq!(output.stdout, "probed c1");
}

#[tokio::test]
async fn exec_hook_command_wraps_failures_with_context() {
    let cri = running_container();
    cri.state().exec_response.exit_code = 1;
    let err = exec_hook(Arc::new(cri), "c1", vec!["false".to_string()], 0)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("exec hook failed in container c1"));
}
