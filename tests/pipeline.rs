use std::sync::Arc;

use fabflow::flowgraph::NodeId;
use fabflow::runtime::{Pipeline, PipelineError, RunEvent, ToolRegistry};
use fabflow::schema::{TypedValue, Violation, default_schema};

mod common;
use common::*;

#[tokio::test]
async fn chain_runs_in_dependency_order_and_forwards_data() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = base_store(tmp.path(), "gcd");
    chain(&mut store, &[("import", "imp"), ("syn", "synth"), ("place", "pl")]);

    let registry = ToolRegistry::new()
        .with(Arc::new(ShellTool::new(
            "imp",
            "echo {step} >> ../order.log; echo {step} > outputs/data.txt",
        )))
        .with(Arc::new(ShellTool::new(
            "synth",
            "echo {step} >> ../order.log; cat inputs/data.txt > outputs/data.txt; echo {step} >> outputs/data.txt",
        )))
        .with(Arc::new(ShellTool::new(
            "pl",
            "echo {step} >> ../order.log; cat inputs/data.txt > outputs/data.txt; echo {step} >> outputs/data.txt",
        )));

    let (mut store, summary) = Pipeline::new(store)
        .with_registry(registry)
        .run()
        .await
        .map_err(|(_, e)| e)
        .unwrap();

    assert_eq!(summary.completed.len(), 3);
    assert!(summary.failed.is_empty());

    // Dependencies serialize the three tasks even though they were spawned
    // together.
    let order = std::fs::read_to_string(summary.job_dir.join("order.log")).unwrap();
    assert_eq!(order, "import\nsyn\nplace\n");

    // Data moved inputs -> outputs hop by hop.
    let data =
        std::fs::read_to_string(summary.job_dir.join("place0/outputs/data.txt")).unwrap();
    assert_eq!(data, "import\nsyn\nplace\n");

    // The merged-back manifest carries status, records, and metrics.
    assert_eq!(
        store.get(&["flowstatus", "place", "0", "error"]),
        TypedValue::Num(0.0)
    );
    assert!(store.get(&["record", "place", "0", "endtime"]).is_set());
    assert!(matches!(
        store.get(&["metric", "place", "0", "runtime", "real"]),
        TypedValue::Num(n) if n >= 0.0
    ));
    // Unreported metrics read as a zero baseline, not unset.
    assert_eq!(
        store.get(&["metric", "place", "0", "drv", "real"]),
        TypedValue::Num(0.0)
    );
    assert!(summary.job_dir.join("fab_manifest.json").is_file());
    assert!(summary.job_dir.join("place0/outputs/gcd.pkg.json").is_file());
    assert!(summary.job_dir.join("place0/replay.sh").is_file());

    // Scratch args stay out of the packages and the merged manifest.
    assert!(store.get(&["arg", "step"]).is_unset());
    let package =
        std::fs::read_to_string(summary.job_dir.join("place0/outputs/gcd.pkg.json")).unwrap();
    assert!(!package.contains("\"arg\""));
}

#[tokio::test]
async fn failing_step_halts_downstream_nodes() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = base_store(tmp.path(), "gcd");
    chain(&mut store, &[("import", "ok"), ("syn", "bad"), ("place", "ok")]);

    let registry = ToolRegistry::new()
        .with(Arc::new(ShellTool::new("ok", "true")))
        .with(Arc::new(ShellTool::new("bad", "exit 1")));

    let (mut store, err) = Pipeline::new(store)
        .with_registry(registry)
        .run()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::StepFailed { ref step } if step == "syn"));

    assert_eq!(
        store.get(&["flowstatus", "import", "0", "error"]),
        TypedValue::Num(0.0)
    );
    assert_eq!(
        store.get(&["flowstatus", "syn", "0", "error"]),
        TypedValue::Num(1.0)
    );
    // The downstream node never ran; it halted on its dead input.
    assert_eq!(
        store.get(&["flowstatus", "place", "0", "error"]),
        TypedValue::Num(1.0)
    );
    assert!(!tmp.path().join("gcd/job0/place0/outputs/gcd.pkg.json").exists());
}

#[tokio::test]
async fn one_dead_input_step_halts_a_tool_node() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = base_store(tmp.path(), "gcd");
    store.set(&["flowgraph", "syn", "0", "tool"], "ok");
    store.set(&["flowgraph", "lec", "0", "tool"], "bad");
    store.set(&["flowgraph", "place", "0", "tool"], "pl");
    store.add(&["flowgraph", "place", "0", "input", "syn"], "0");
    store.add(&["flowgraph", "place", "0", "input", "lec"], "0");

    let registry = ToolRegistry::new()
        .with(Arc::new(ShellTool::new("ok", "true")))
        .with(Arc::new(ShellTool::new("bad", "exit 1")))
        .with(Arc::new(ShellTool::new("pl", "touch outputs/ran.txt")));

    let (mut store, err) = Pipeline::new(store)
        .with_registry(registry)
        .run()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::StepFailed { ref step } if step == "lec"));

    // syn survived, but place must not run on partial inputs.
    assert_eq!(
        store.get(&["flowstatus", "syn", "0", "error"]),
        TypedValue::Num(0.0)
    );
    assert_eq!(
        store.get(&["flowstatus", "place", "0", "error"]),
        TypedValue::Num(1.0)
    );
    assert!(!tmp.path().join("gcd/job0/place0/outputs/ran.txt").exists());
}

#[tokio::test]
async fn violations_recorded_before_the_run_gate_it() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = base_store(tmp.path(), "gcd");
    chain(&mut store, &[("syn", "ok")]);
    // Rejected during configuration; the run must refuse to start.
    store.set(&["jobid"], "not-a-number");

    let registry = ToolRegistry::new().with(Arc::new(ShellTool::new("ok", "true")));
    let (_, err) = Pipeline::new(store)
        .with_registry(registry)
        .run()
        .await
        .err()
        .unwrap();
    let PipelineError::ConfigInvalid { violations } = err else {
        panic!("expected ConfigInvalid, got {err}");
    };
    assert!(violations.iter().any(|v| matches!(
        v,
        Violation::TypeMismatch { keypath, .. } if keypath == "jobid"
    )));
}

#[tokio::test]
async fn continue_bit_tolerates_nonzero_exit() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = base_store(tmp.path(), "gcd");
    chain(&mut store, &[("syn", "flaky")]);

    let registry =
        ToolRegistry::new().with(Arc::new(ShellTool::new("flaky", "exit 1").tolerant()));

    let (_, summary) = Pipeline::new(store)
        .with_registry(registry)
        .run()
        .await
        .map_err(|(_, e)| e)
        .unwrap();
    assert_eq!(summary.completed, vec![NodeId::new("syn", "0")]);
}

#[tokio::test]
async fn steplist_restricts_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = base_store(tmp.path(), "gcd");
    chain(&mut store, &[("import", "ok"), ("syn", "ok")]);
    store.add(&["steplist"], "import");

    let registry = ToolRegistry::new().with(Arc::new(ShellTool::new("ok", "true")));
    let (_, summary) = Pipeline::new(store)
        .with_registry(registry)
        .run()
        .await
        .map_err(|(_, e)| e)
        .unwrap();

    assert_eq!(summary.completed, vec![NodeId::new("import", "0")]);
    assert!(summary.job_dir.join("import0").is_dir());
    assert!(!summary.job_dir.join("syn0").exists());
}

#[tokio::test]
async fn missing_required_settings_fail_the_static_check() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = default_schema();
    // design carries requirement=all and stays unset
    store.set(&["dir"], tmp.path().to_str().unwrap());
    chain(&mut store, &[("syn", "ok")]);

    let registry = ToolRegistry::new().with(Arc::new(ShellTool::new("ok", "true")));
    let (_, err) = Pipeline::new(store)
        .with_registry(registry)
        .run()
        .await
        .err()
        .unwrap();
    let PipelineError::ConfigInvalid { violations } = err else {
        panic!("expected ConfigInvalid, got {err}");
    };
    assert!(violations.iter().any(|v| matches!(
        v,
        Violation::RequirementMissing { keypath, .. } if keypath == "design"
    )));
}

#[tokio::test]
async fn unregistered_tool_fails_the_static_check() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = base_store(tmp.path(), "gcd");
    chain(&mut store, &[("syn", "yosys")]);

    let (_, err) = Pipeline::new(store).run().await.err().unwrap();
    let PipelineError::ConfigInvalid { violations } = err else {
        panic!("expected ConfigInvalid, got {err}");
    };
    // No adapter declared exe/version, so the tool check flags them.
    assert!(violations
        .iter()
        .any(|v| matches!(v, Violation::ToolRequirementMissing { tool, .. } if tool == "yosys")));
}

#[tokio::test]
async fn empty_flowgraph_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let store = base_store(tmp.path(), "gcd");
    let (_, err) = Pipeline::new(store).run().await.err().unwrap();
    assert!(matches!(err, PipelineError::EmptyFlowgraph));
}

#[tokio::test]
async fn version_probe_gates_execution() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = base_store(tmp.path(), "gcd");
    chain(&mut store, &[("syn", "vt")]);
    let registry = ToolRegistry::new().with(Arc::new(VersionTool {
        tool_name: "vt",
        required: "1.2",
        reported: "tool 1.2.3",
    }));
    let (_, summary) = Pipeline::new(store)
        .with_registry(registry)
        .run()
        .await
        .map_err(|(_, e)| e)
        .unwrap();
    assert_eq!(summary.completed.len(), 1);

    let mut store = base_store(tmp.path(), "gcd");
    chain(&mut store, &[("syn", "vt")]);
    let registry = ToolRegistry::new().with(Arc::new(VersionTool {
        tool_name: "vt",
        required: "9.9",
        reported: "tool 1.2.3",
    }));
    let (_, err) = Pipeline::new(store)
        .with_registry(registry)
        .run()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PipelineError::StepFailed { ref step } if step == "syn"));
}

#[tokio::test]
async fn events_track_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = base_store(tmp.path(), "gcd");
    chain(&mut store, &[("import", "ok"), ("syn", "ok")]);

    let registry = ToolRegistry::new().with(Arc::new(ShellTool::new("ok", "true")));
    let mut pipeline = Pipeline::new(store).with_registry(registry);
    let events = pipeline.subscribe();
    pipeline.run().await.map_err(|(_, e)| e).unwrap();

    let events: Vec<RunEvent> = events.drain().collect();
    assert!(matches!(events.first(), Some(RunEvent::JobStarted { .. })));
    assert!(matches!(events.last(), Some(RunEvent::JobFinished { failed_steps, .. }) if failed_steps.is_empty()));
    let done = events
        .iter()
        .filter(|e| matches!(e, RunEvent::NodeDone { .. }))
        .count();
    assert_eq!(done, 2);
}
