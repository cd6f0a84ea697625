//! Per-node execution.
//!
//! Each flow node runs as its own task over a private copy of the manifest,
//! so a misbehaving tool hook can never corrupt a sibling's view. Nodes
//! coordinate only through `watch` channels carrying a [`NodeSignal`]:
//! a node starts pessimistic (`active`, `error`) and flips exactly once on
//! exit, so downstream waiters observe completion and success atomically.
//! Any halt is confined to the node; the scheduler decides what it means
//! for the job.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::watch;

use crate::flowgraph::{
    Flowgraph, NodeId, SelectorError, check, run_selector,
};
use crate::schema::manifest::{
    ManifestError, read_manifest, snapshot_all_formats, write_manifest, WriteOptions,
};
use crate::schema::{KeyStore, METRICS, MergeMode, TypedValue, merge, prune};

use super::events::{EventBus, RunEvent};
use super::remote::{RemoteDispatch, RemoteError, RemoteRequest};
use super::tooling::{ToolError, ToolRegistry};
use super::workspace::{JobDirs, WorkspaceError, copy_dir_contents, write_replay_script};

/// Completion state a node publishes on its watch channel. Starts
/// pessimistic; flips once when the node exits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeSignal {
    pub active: bool,
    pub error: bool,
}

impl Default for NodeSignal {
    fn default() -> Self {
        Self {
            active: true,
            error: true,
        }
    }
}

/// Everything a step runner shares with its siblings.
pub struct RunContext {
    pub registry: ToolRegistry,
    pub remote: Option<Arc<dyn RemoteDispatch>>,
    pub events: EventBus,
    pub dirs: JobDirs,
    pub quiet: bool,
}

#[derive(Debug, Error, Diagnostic)]
pub enum StepError {
    #[error("node {node} is not declared in the flowgraph")]
    #[diagnostic(code(fabflow::step::unknown_node))]
    UnknownNode { node: String },

    #[error("node {node} binds neither a tool nor a selector function")]
    #[diagnostic(code(fabflow::step::unbound))]
    UnboundNode { node: String },

    #[error("no index of input step '{step}' completed for {node}")]
    #[diagnostic(code(fabflow::step::inputs_failed))]
    InputStepFailed { node: String, step: String },

    #[error("pre-run check of {node} found {count} violation(s)")]
    #[diagnostic(
        code(fabflow::step::check_failed),
        help("Run the static check to see the full violation list.")
    )]
    CheckFailed { node: String, count: usize },

    #[error("no adapter registered for tool '{tool}'")]
    #[diagnostic(code(fabflow::step::unknown_tool))]
    UnknownTool { tool: String },

    #[error("tool '{tool}' reported version '{reported}', required '{required}'")]
    #[diagnostic(code(fabflow::step::version))]
    VersionMismatch {
        tool: String,
        required: String,
        reported: String,
    },

    #[error("failed to spawn '{tool}': {source}")]
    #[diagnostic(code(fabflow::step::spawn))]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tool '{tool}' exited with status {status}")]
    #[diagnostic(code(fabflow::step::exit))]
    ExitStatus { tool: String, status: String },

    #[error("tool '{tool}' post-process reported {count} error(s)")]
    #[diagnostic(code(fabflow::step::tool_errors))]
    ToolErrors { tool: String, count: u64 },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Remote(#[from] RemoteError),
}

/// What one node run came to.
#[derive(Debug)]
pub struct NodeOutcome {
    pub id: NodeId,
    pub result: Result<(), StepError>,
}

/// Run one flow node to completion and publish the outcome on `signal`.
///
/// The signal flips on every exit path, success or halt, so no waiter can
/// deadlock on this node.
#[tracing::instrument(skip_all, fields(node = %id))]
pub async fn run_step(
    mut store: KeyStore,
    graph: Arc<Flowgraph>,
    id: NodeId,
    ctx: Arc<RunContext>,
    inputs: Vec<(NodeId, watch::Receiver<NodeSignal>)>,
    signal: watch::Sender<NodeSignal>,
) -> NodeOutcome {
    let result = run_step_inner(&mut store, &graph, &id, &ctx, inputs).await;
    match &result {
        Ok(()) => {
            tracing::info!(node = %id, "node done");
            ctx.events.emit(RunEvent::NodeDone { node: id.clone() });
            signal.send_replace(NodeSignal {
                active: false,
                error: false,
            });
        }
        Err(err) => {
            tracing::error!(node = %id, error = %err, "node halted");
            ctx.events.emit(RunEvent::NodeHalted {
                node: id.clone(),
                reason: err.to_string(),
            });
            signal.send_replace(NodeSignal {
                active: false,
                error: true,
            });
        }
    }
    NodeOutcome { id, result }
}

async fn run_step_inner(
    store: &mut KeyStore,
    graph: &Flowgraph,
    id: &NodeId,
    ctx: &RunContext,
    inputs: Vec<(NodeId, watch::Receiver<NodeSignal>)>,
) -> Result<(), StepError> {
    let node = graph
        .node(id)
        .cloned()
        .ok_or_else(|| StepError::UnknownNode {
            node: id.to_string(),
        })?;

    // Wait for every declared input; a dropped sender counts as a failure.
    let mut ready: Vec<(NodeId, bool)> = Vec::with_capacity(inputs.len());
    for (input_id, mut rx) in inputs {
        let errored = match rx.wait_for(|s| !s.active).await {
            Ok(state) => state.error,
            Err(_) => true,
        };
        tracing::debug!(node = %id, input = %input_id, errored, "input settled");
        ready.push((input_id, errored));
    }

    ctx.events.emit(RunEvent::NodeStarted { node: id.clone() });
    let started = Instant::now();
    let starttime = Utc::now();

    // Tool nodes need at least one usable index from every input step;
    // selectors screen for themselves.
    if node.function.is_none() {
        for step in node.inputs.keys() {
            let mut declared = false;
            let mut usable = false;
            for (input_id, errored) in &ready {
                if input_id.step == *step {
                    declared = true;
                    usable |= !errored;
                }
            }
            if declared && !usable {
                return Err(StepError::InputStepFailed {
                    node: id.to_string(),
                    step: step.clone(),
                });
            }
        }
    }

    // Adopt what the surviving inputs learned: their result packages carry
    // the metrics, records, and settings this node builds on.
    for (input_id, errored) in &ready {
        if *errored {
            continue;
        }
        let package = ctx.dirs.package_path(input_id);
        if package.is_file() {
            let tree = read_manifest(&package)?;
            merge(store.root_mut(), &tree, MergeMode::Replace);
        }
    }

    let workdir = ctx.dirs.prepare_node_dir(id)?;

    // Publish goals and reset every metric to a zero baseline before
    // anything runs, so unreported metrics read as 0 rather than unset.
    for (metric, goal) in &node.goals {
        store.set(&["metric", &id.step, &id.index, metric, "goal"], *goal);
    }
    for &metric in METRICS {
        store.set(&["metric", &id.step, &id.index, metric, "real"], 0.0);
    }
    store.set(&["arg", "step"], id.step.as_str());
    store.set(&["arg", "index"], id.index.as_str());

    let violations = check(store, graph, std::slice::from_ref(id));
    if !violations.is_empty() {
        for violation in &violations {
            tracing::error!(node = %id, %violation, "check violation");
        }
        return Err(StepError::CheckFailed {
            node: id.to_string(),
            count: violations.len(),
        });
    }

    if let Some(kind) = node.function {
        let selection = run_selector(kind, store, graph, &node)?;
        let selected: Vec<String> = selection.selected.iter().map(ToString::to_string).collect();
        tracing::info!(node = %id, selected = ?selected, score = ?selection.score, "selection");
        store.set(&["flowstatus", &id.step, &id.index, "select"], selected);
        // Adopt the winners' outputs as our own.
        for winner in &selection.selected {
            let src = ctx.dirs.outputs_dir(winner);
            if src.is_dir() {
                copy_dir_contents(&src, &ctx.dirs.outputs_dir(id))?;
            }
        }
    } else if let Some(tool) = node.tool.clone() {
        for (input_id, errored) in &ready {
            if !errored {
                let src = ctx.dirs.outputs_dir(input_id);
                if src.is_dir() {
                    copy_dir_contents(&src, &ctx.dirs.inputs_dir(id))?;
                }
            }
        }
        if get_str(store, &["remote", "addr"]).is_some() {
            run_remote(store, id, ctx).await?;
        } else {
            run_tool(store, id, ctx, &tool, &workdir).await?;
        }
    } else {
        return Err(StepError::UnboundNode {
            node: id.to_string(),
        });
    }

    finish_records(store, id, &starttime, started.elapsed().as_secs_f64());
    store.set(&["flowstatus", &id.step, &id.index, "error"], 0.0);
    // Scratch args are per-run state; keep them out of the node package.
    store.unset(&["arg", "step"]);
    store.unset(&["arg", "index"]);
    write_manifest(
        store.root(),
        &ctx.dirs.package_path(id),
        WriteOptions::default(),
    )?;
    Ok(())
}

/// Local tool execution: version probe, spawn, post-process. The adapter's
/// `setup` already ran on the master manifest before scheduling.
async fn run_tool(
    store: &mut KeyStore,
    id: &NodeId,
    ctx: &RunContext,
    tool: &str,
    workdir: &Path,
) -> Result<(), StepError> {
    let adapter = ctx
        .registry
        .get(tool)
        .ok_or_else(|| StepError::UnknownTool {
            tool: tool.to_string(),
        })?;

    let exe = get_str(store, &["tool", tool, &id.step, &id.index, "exe"]).unwrap_or_default();
    let options = store
        .get(&["tool", tool, &id.step, &id.index, "option"])
        .into_str_list();
    let scripts = store
        .get(&["tool", tool, &id.step, &id.index, "script"])
        .into_str_list();
    let refdir = get_str(store, &["tool", tool, &id.step, &id.index, "refdir"]);
    let copy_ref = get_bool(store, &["tool", tool, &id.step, &id.index, "copy"]);
    let tolerate = get_bool(store, &["tool", tool, &id.step, &id.index, "continue"]);

    if copy_ref && let Some(refdir) = refdir {
        copy_dir_contents(Path::new(&refdir), workdir)?;
    }

    adapter.pre_process(store, id, workdir)?;

    if let (Some(required), Some(vswitch)) = (
        get_str(store, &["tool", tool, &id.step, &id.index, "version"]),
        get_str(store, &["tool", tool, &id.step, &id.index, "vswitch"]),
    ) {
        let probe = tokio::process::Command::new(&exe)
            .arg(&vswitch)
            .output()
            .await
            .map_err(|source| StepError::Spawn {
                tool: tool.to_string(),
                source,
            })?;
        let reported = String::from_utf8_lossy(&probe.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&probe.stderr).lines())
            .next()
            .unwrap_or_default()
            .to_string();
        if !adapter.check_version(&required, &reported) {
            return Err(StepError::VersionMismatch {
                tool: tool.to_string(),
                required,
                reported,
            });
        }
        tracing::debug!(node = %id, tool, version = %reported, "version accepted");
    }

    // The manifest the tool sees, in every format it might source.
    snapshot_all_formats(store.root(), workdir)?;

    let mut args = options;
    args.extend(scripts);
    write_replay_script(workdir, &exe, &args)?;

    let log_name = Path::new(&exe)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("tool");
    let log_path = workdir.join(format!("{log_name}.log"));
    let log = std::fs::File::create(&log_path).map_err(|e| WorkspaceError::Io {
        path: log_path.display().to_string(),
        source: e,
    })?;
    let log_err = log.try_clone().map_err(|e| WorkspaceError::Io {
        path: log_path.display().to_string(),
        source: e,
    })?;

    if !ctx.quiet {
        tracing::info!(node = %id, tool, exe = %exe, log = %log_path.display(), "spawning");
    }
    let status = tokio::process::Command::new(&exe)
        .args(&args)
        .current_dir(workdir)
        .stdout(std::process::Stdio::from(log))
        .stderr(std::process::Stdio::from(log_err))
        .status()
        .await
        .map_err(|source| StepError::Spawn {
            tool: tool.to_string(),
            source,
        })?;

    if !status.success() && !tolerate {
        return Err(StepError::ExitStatus {
            tool: tool.to_string(),
            status: status.to_string(),
        });
    }

    let errors = adapter.post_process(store, id, workdir)?;
    if errors > 0 {
        store.set(
            &["metric", &id.step, &id.index, "errors", "real"],
            errors as f64,
        );
        if !tolerate {
            return Err(StepError::ToolErrors {
                tool: tool.to_string(),
                count: errors,
            });
        }
    }
    Ok(())
}

/// Ship the node to the configured dispatcher and adopt its manifest.
async fn run_remote(store: &mut KeyStore, id: &NodeId, ctx: &RunContext) -> Result<(), StepError> {
    let dispatcher = ctx.remote.as_ref().ok_or(RemoteError::Unconfigured)?;
    let addr = get_str(store, &["remote", "addr"]).unwrap_or_default();
    let port = match store.get(&["remote", "port"]) {
        TypedValue::Num(n) => Some(n as u16),
        _ => None,
    };
    tracing::info!(node = %id, addr = %addr, "dispatching remotely");
    let response = dispatcher
        .dispatch(RemoteRequest {
            node: id.clone(),
            manifest: prune(store.root(), false),
            addr,
            port,
        })
        .await?;
    merge(store.root_mut(), &response.manifest, MergeMode::Replace);
    Ok(())
}

fn finish_records(
    store: &mut KeyStore,
    id: &NodeId,
    starttime: &chrono::DateTime<Utc>,
    elapsed: f64,
) {
    store.set(
        &["record", &id.step, &id.index, "starttime"],
        starttime.to_rfc3339(),
    );
    store.set(
        &["record", &id.step, &id.index, "endtime"],
        Utc::now().to_rfc3339(),
    );
    if let Some(userid) = get_str(store, &["userid"]) {
        store.set(&["record", &id.step, &id.index, "userid"], userid.as_str());
        store.set(&["record", &id.step, &id.index, "author"], userid.as_str());
    }
    if let Some(machine) = get_str(store, &["machine"]) {
        store.set(&["record", &id.step, &id.index, "machine"], machine);
    }
    store.set(
        &["record", &id.step, &id.index, "version"],
        env!("CARGO_PKG_VERSION"),
    );
    store.set(&["metric", &id.step, &id.index, "runtime", "real"], elapsed);
}

fn get_str(store: &mut KeyStore, keypath: &[&str]) -> Option<String> {
    store.get(keypath).as_str().map(str::to_string)
}

fn get_bool(store: &mut KeyStore, keypath: &[&str]) -> bool {
    store.get(keypath).as_bool().unwrap_or(false)
}
