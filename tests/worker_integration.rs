//! Worker integration tests: orchestrator, scheduler and a real worker
//! running shell modules, all on one in-memory broker.
#![cfg(unix)]

use serde_json::json;
use sortie_core::broker::{BrokerHandle, MemoryBroker};
use sortie_core::definition::PlanTemplate;
use sortie_core::engine::{Engine, RunReport};
use sortie_core::orchestrator::Orchestrator;
use sortie_core::rpc::{Outbox, ResultCode, RpcClient};
use sortie_core::scheduler::SchedulerService;
use sortie_core::state::ExecutionState;
use sortie_core::store::Store;
use sortie_core::types::{OrchestratorConfig, ReconnectPolicy, RunId, SchedulerConfig, WorkerConfig};
use sortie_core::worker::Worker;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const ECHO: &str = r#"read input; printf '{"result":"ok","output":"ran","serialized_output":%s}' "$input""#;

fn module(dir: &Path, name: &str, script: &str) {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct Deployment {
    orchestrator: Orchestrator,
    worker: Worker,
    scheduler: Arc<SchedulerService>,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

impl Deployment {
    async fn new() -> Self {
        let broker = MemoryBroker::new();
        let handle: BrokerHandle = Arc::new(broker);
        let outbox = Outbox::new(handle.clone(), ReconnectPolicy::default());

        let modules = tempfile::tempdir().unwrap();
        module(modules.path(), "echo", ECHO);
        module(modules.path(), "sleepy", "sleep 30");
        let evidence = tempfile::tempdir().unwrap();

        let scheduler = Arc::new(SchedulerService::new(handle.clone(), outbox.clone(), &SchedulerConfig::default()));
        let running = scheduler.clone();
        tokio::spawn(async move { running.run().await });

        let worker = Worker::with_inventory(
            handle.clone(),
            outbox.clone(),
            WorkerConfig {
                name: "w1".into(),
                consumers: 2,
                action_workers: 2,
                modules_dir: modules.path().to_path_buf(),
                ..WorkerConfig::default()
            },
            None,
        );
        worker.start().await.unwrap();

        let config = OrchestratorConfig {
            rpc_timeout: Duration::from_secs(2),
            evidence_dir: evidence.path().to_path_buf(),
            ..OrchestratorConfig::default()
        };
        let rpc = RpcClient::new(handle.clone(), outbox);
        let orchestrator = Orchestrator::new(Engine::new(Store::new(), rpc, config), handle);
        orchestrator.start().await.unwrap();

        // Let the scheduler attach its consumer.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Self {
            orchestrator,
            worker,
            scheduler,
            _dirs: (modules, evidence),
        }
    }

    fn engine(&self) -> &Engine {
        self.orchestrator.engine()
    }

    async fn start(&self, yaml: &str) -> RunId {
        let engine = self.engine();
        let plan = engine
            .create_plan(&PlanTemplate::from_yaml(yaml).unwrap())
            .await
            .unwrap();
        let worker = engine.register_worker("w1", "").await.unwrap();
        let run = engine.create_run(&plan.id, &[worker.id]).await.unwrap();
        engine.start_run(&run.id).await.unwrap();
        run.id
    }

    async fn wait_for<F>(&self, run_id: &RunId, done: F) -> RunReport
    where
        F: Fn(&RunReport) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let report = self.engine().run_report(run_id).await.unwrap();
            if done(&report) || tokio::time::Instant::now() > deadline {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn stop(self) {
        self.orchestrator.shutdown();
        self.worker.shutdown().await;
        self.scheduler.shutdown();
    }
}

#[tokio::test]
async fn test_module_output_reaches_the_report() {
    let deployment = Deployment::new().await;
    let run_id = deployment
        .start(
            r#"
plan:
  name: echo
  stages:
    - name: a
      steps:
        - {name: first, module: echo, is_init: true, arguments: {target: "10.0.0.7"}, next: [{type: result, value: ok, step: second}]}
        - {name: second, module: echo, arguments: {seen: "$first.target"}}
"#,
        )
        .await;

    let report = deployment.wait_for(&run_id, RunReport::is_terminal).await;
    assert_eq!(report.state, ExecutionState::Finished);
    let steps = &report.plan_executions[0].stage_executions[0].step_executions;
    assert_eq!(steps[0].result, Some(ResultCode::Ok));
    assert_eq!(steps[0].output.as_deref(), Some("ran"));
    assert_eq!(steps[1].serialized_output, Some(json!({"seen": "10.0.0.7"})));
    assert!(report.plan_executions[0].evidence_dir.as_ref().unwrap().is_dir());
    deployment.stop().await;
}

#[tokio::test]
async fn test_http_trigger_starts_stage() {
    let deployment = Deployment::new().await;
    let port = free_port().await;
    let run_id = deployment
        .start(&format!(
            r#"
plan:
  name: callback
  stages:
    - name: wait
      trigger_type: http
      trigger_args:
        host: 127.0.0.1
        port: {port}
        routes: [{{path: /beacon, method: GET, parameters: [{{name: host}}]}}]
      steps:
        - {{name: pivot, module: echo, is_init: true, arguments: {{via: "$trigger.host"}}}}
"#
        ))
        .await;

    let report = deployment
        .wait_for(&run_id, |r| {
            r.plan_executions[0].stage_executions[0].state == ExecutionState::Awaiting
        })
        .await;
    assert_eq!(report.plan_executions[0].stage_executions[0].state, ExecutionState::Awaiting);
    assert_eq!(deployment.worker.listeners().list().await.len(), 1);

    let response = reqwest::get(format!("http://127.0.0.1:{}/beacon?host=10.9.9.9", port))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let report = deployment.wait_for(&run_id, RunReport::is_terminal).await;
    assert_eq!(report.state, ExecutionState::Finished);
    let pivot = &report.plan_executions[0].stage_executions[0].step_executions[0];
    assert_eq!(pivot.serialized_output, Some(json!({"via": "10.9.9.9"})));
    assert!(deployment.worker.listeners().list().await.is_empty());
    deployment.stop().await;
}

#[tokio::test]
async fn test_delta_trigger_fires_through_scheduler() {
    let deployment = Deployment::new().await;
    let run_id = deployment
        .start(
            r#"
plan:
  name: delayed
  stages:
    - name: later
      trigger_type: delta
      trigger_args: {seconds: 1}
      steps: [{name: go, module: echo, is_init: true}]
"#,
        )
        .await;

    let report = deployment.engine().run_report(&run_id).await.unwrap();
    let stage = &report.plan_executions[0].stage_executions[0];
    assert_eq!(stage.state, ExecutionState::Scheduled);
    assert!(stage.times.schedule_time.is_some());

    let report = deployment.wait_for(&run_id, RunReport::is_terminal).await;
    assert_eq!(report.state, ExecutionState::Finished);
    deployment.stop().await;
}

#[tokio::test]
async fn test_kill_stops_module_process() {
    let deployment = Deployment::new().await;
    let run_id = deployment
        .start(
            r#"
plan:
  name: runaway
  stages:
    - name: a
      steps: [{name: forever, module: sleepy, is_init: true}]
"#,
        )
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while deployment.worker.tasks().list().await.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(deployment.worker.tasks().list().await.len(), 1);

    deployment.engine().kill_run(&run_id).await.unwrap();
    let report = deployment.engine().run_report(&run_id).await.unwrap();
    assert_eq!(report.state, ExecutionState::Terminated);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !deployment.worker.tasks().list().await.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(deployment.worker.tasks().list().await.is_empty());
    deployment.stop().await;
}
