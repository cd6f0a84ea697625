use std::sync::Arc;

use async_trait::async_trait;
use fabflow::runtime::{
    Pipeline, PipelineError, RemoteDispatch, RemoteError, RemoteRequest, RemoteResponse,
    ToolRegistry,
};
use fabflow::schema::{MergeMode, TypedValue, default_schema, merge, prune};

mod common;
use common::*;

/// Dispatcher standing in for a compute fabric: rehydrates the shipped
/// manifest into a schema, "runs" the node, and ships the result back.
struct EchoDispatch;

#[async_trait]
impl RemoteDispatch for EchoDispatch {
    async fn dispatch(&self, request: RemoteRequest) -> Result<RemoteResponse, RemoteError> {
        let mut store = default_schema();
        merge(store.root_mut(), &request.manifest, MergeMode::Replace);
        store.set(
            &["metric", &request.node.step, &request.node.index, "area", "real"],
            12.0,
        );
        Ok(RemoteResponse {
            manifest: prune(store.root(), false),
        })
    }
}

#[tokio::test]
async fn remote_dispatch_replaces_local_execution() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = base_store(tmp.path(), "gcd");
    chain(&mut store, &[("syn", "pl")]);
    store.set(&["remote", "addr"], "fab.example.com");
    store.set(&["remote", "port"], 8080.0);

    let registry = ToolRegistry::new().with(Arc::new(ShellTool::new(
        "pl",
        "echo ran > outputs/ran.txt",
    )));
    let (mut store, summary) = Pipeline::new(store)
        .with_registry(registry)
        .with_remote(Arc::new(EchoDispatch))
        .run()
        .await
        .map_err(|(_, e)| e)
        .unwrap();

    assert_eq!(summary.completed.len(), 1);
    // The remote result was adopted and the local executable never ran.
    assert_eq!(
        store.get(&["metric", "syn", "0", "area", "real"]),
        TypedValue::Num(12.0)
    );
    assert!(!summary.job_dir.join("syn0/outputs/ran.txt").exists());
}

#[tokio::test]
async fn remote_addr_without_dispatcher_halts_the_node() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = base_store(tmp.path(), "gcd");
    chain(&mut store, &[("syn", "pl")]);
    store.set(&["remote", "addr"], "fab.example.com");

    let registry = ToolRegistry::new().with(Arc::new(ShellTool::new("pl", "true")));
    let (_, err) = Pipeline::new(store)
        .with_registry(registry)
        .run()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::StepFailed { ref step } if step == "syn"));
}
