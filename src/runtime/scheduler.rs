//! Job scheduling: fan the flowgraph out over tasks and fold results back.
//!
//! The pipeline validates everything up front, spawns one task per selected
//! flow node with a private manifest copy, and wires the tasks together
//! with `watch` channels. A step fails only when every one of its indices
//! fails; surviving indices of the final step have their result packages
//! merged back into the master manifest.

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::flowgraph::{Flowgraph, NodeId, check};
use crate::schema::manifest::{
    MANIFEST_STEM, ManifestError, read_manifest, write_manifest, WriteOptions,
};
use crate::schema::{KeyStore, MergeMode, TypedValue, Violation, merge};

use super::events::{EventBus, RunEvent};
use super::remote::RemoteDispatch;
use super::step_runner::{NodeSignal, RunContext, run_step};
use super::tooling::ToolRegistry;
use super::workspace::{JobDirs, WorkspaceError};

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("the flowgraph declares no nodes")]
    #[diagnostic(code(fabflow::pipeline::empty))]
    EmptyFlowgraph,

    #[error("configuration check failed with {} violation(s)", violations.len())]
    #[diagnostic(
        code(fabflow::pipeline::config),
        help("Every violation is listed in the error source chain and the log.")
    )]
    ConfigInvalid { violations: Vec<Violation> },

    #[error("step '{step}' failed on every index")]
    #[diagnostic(code(fabflow::pipeline::step_failed))]
    StepFailed { step: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Tool(#[from] super::tooling::ToolError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Manifest(#[from] ManifestError),
}

/// Aggregate result of a pipeline run.
#[derive(Debug)]
pub struct RunSummary {
    /// Nodes that completed, in completion order.
    pub completed: Vec<NodeId>,
    /// Nodes that halted, in completion order.
    pub failed: Vec<NodeId>,
    /// Job directory the run worked in.
    pub job_dir: std::path::PathBuf,
}

/// A configured job: manifest plus the adapters and transports it may need.
pub struct Pipeline {
    store: KeyStore,
    registry: ToolRegistry,
    remote: Option<Arc<dyn RemoteDispatch>>,
    events: EventBus,
}

impl Pipeline {
    #[must_use]
    pub fn new(store: KeyStore) -> Self {
        Self {
            store,
            registry: ToolRegistry::new(),
            remote: None,
            events: EventBus::disabled(),
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_remote(mut self, remote: Arc<dyn RemoteDispatch>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Attach an event subscriber; replaces any previous one.
    pub fn subscribe(&mut self) -> flume::Receiver<RunEvent> {
        let (bus, receiver) = EventBus::channel();
        self.events = bus;
        receiver
    }

    #[must_use]
    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    #[must_use]
    pub fn store_mut(&mut self) -> &mut KeyStore {
        &mut self.store
    }

    /// Execute the flow and fold the results back into the manifest.
    ///
    /// Consumes the pipeline and returns the final store alongside the
    /// summary so callers can inspect metrics and records after the run.
    pub async fn run(mut self) -> Result<(KeyStore, RunSummary), (KeyStore, PipelineError)> {
        match self.run_inner().await {
            Ok(summary) => Ok((self.store, summary)),
            Err(err) => Err((self.store, err)),
        }
    }

    #[tracing::instrument(skip_all)]
    async fn run_inner(&mut self) -> Result<RunSummary, PipelineError> {
        let store = &mut self.store;
        let graph = Flowgraph::from_store(store);
        if graph.is_empty() {
            return Err(PipelineError::EmptyFlowgraph);
        }

        // Steps to run, in dependency order.
        let steplist = store.get(&["steplist"]).into_str_list();
        let ordered = graph.steps();
        let selected_steps: Vec<String> = if steplist.is_empty() {
            ordered
        } else {
            ordered
                .into_iter()
                .filter(|s| steplist.contains(s))
                .collect()
        };
        let selected: Vec<NodeId> = selected_steps
            .iter()
            .flat_map(|step| {
                graph
                    .indices(step)
                    .into_iter()
                    .map(|index| NodeId::new(step.clone(), index))
            })
            .collect();

        // Let every bound adapter declare its settings, then validate the
        // result before anything is spawned. Unregistered tools leave their
        // settings empty and fall out of the check as violations.
        for id in &selected {
            if let Some(node) = graph.node(id)
                && let Some(tool) = &node.tool
            {
                match self.registry.get(tool) {
                    Some(adapter) => adapter.setup(store, id)?,
                    None => {
                        tracing::warn!(node = %id, tool, "no adapter registered");
                    }
                }
            }
        }

        // The fail-soft accessor has been collecting violations since the
        // store was built; they gate the run together with the static check.
        let mut violations = store.take_violations();
        violations.extend(check(store, &graph, &selected));
        violations.extend(store.take_violations());
        if !violations.is_empty() {
            return Err(PipelineError::ConfigInvalid { violations });
        }

        let dirs = JobDirs::from_store(store);
        let design = dirs.design().to_string();
        self.events.emit(RunEvent::JobStarted {
            design,
            job: dirs
                .job_dir()
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string(),
            at: chrono::Utc::now(),
        });

        // Pessimistic status for everything about to run.
        for id in &selected {
            store.set(&["flowstatus", &id.step, &id.index, "error"], 1.0);
        }

        // One watch channel per selected node. Inputs outside the selection
        // (partial runs over an imported manifest) get a pre-settled channel
        // reflecting their recorded status.
        let mut senders: FxHashMap<NodeId, watch::Sender<NodeSignal>> = FxHashMap::default();
        let mut receivers: FxHashMap<NodeId, watch::Receiver<NodeSignal>> = FxHashMap::default();
        for id in &selected {
            let (tx, rx) = watch::channel(NodeSignal::default());
            senders.insert(id.clone(), tx);
            receivers.insert(id.clone(), rx);
        }
        for id in &selected {
            let inputs = graph.node(id).map(|n| n.input_ids()).unwrap_or_default();
            for input in inputs {
                if !receivers.contains_key(&input) {
                    let errored = matches!(
                        store.get(&["flowstatus", &input.step, &input.index, "error"]),
                        TypedValue::Num(n) if n != 0.0
                    );
                    let (tx, rx) = watch::channel(NodeSignal {
                        active: false,
                        error: errored,
                    });
                    // Keep the sender alive in the map so the receiver
                    // never reads as closed.
                    senders.insert(input.clone(), tx);
                    receivers.insert(input, rx);
                }
            }
        }

        let ctx = Arc::new(RunContext {
            registry: self.registry.clone(),
            remote: self.remote.clone(),
            events: self.events.clone(),
            dirs: dirs.clone(),
            quiet: matches!(store.get(&["quiet"]), TypedValue::Bool(true)),
        });
        let graph = Arc::new(graph);

        let mut tasks = JoinSet::new();
        for id in &selected {
            let inputs: Vec<(NodeId, watch::Receiver<NodeSignal>)> = graph
                .node(id)
                .map(|n| n.input_ids())
                .unwrap_or_default()
                .into_iter()
                .filter_map(|input| receivers.get(&input).map(|rx| (input, rx.clone())))
                .collect();
            let signal = senders
                .remove(id)
                .unwrap_or_else(|| watch::channel(NodeSignal::default()).0);
            tasks.spawn(run_step(
                store.clone(),
                Arc::clone(&graph),
                id.clone(),
                Arc::clone(&ctx),
                inputs,
                signal,
            ));
        }

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    tracing::error!(error = %join_err, "step task panicked");
                    continue;
                }
            };
            let error = if outcome.result.is_ok() { 0.0 } else { 1.0 };
            store.set(
                &["flowstatus", &outcome.id.step, &outcome.id.index, "error"],
                error,
            );
            if outcome.result.is_ok() {
                completed.push(outcome.id);
            } else {
                failed.push(outcome.id);
            }
        }

        // Adopt results of the final step's surviving indices.
        if let Some(last_step) = selected_steps.last() {
            for index in graph.indices(last_step) {
                let id = NodeId::new(last_step.clone(), index);
                if completed.contains(&id) {
                    let package = dirs.package_path(&id);
                    if package.is_file() {
                        let tree = read_manifest(&package)?;
                        merge(store.root_mut(), &tree, MergeMode::Replace);
                    }
                }
            }
        }

        // Final manifest snapshot next to the node directories.
        write_manifest(
            store.root(),
            &dirs.job_dir().join(format!("{MANIFEST_STEM}.json")),
            WriteOptions::default(),
        )?;

        let failed_steps: Vec<String> = selected_steps
            .iter()
            .filter(|step| {
                let indices = graph.indices(step);
                !indices.is_empty()
                    && indices
                        .iter()
                        .all(|i| failed.contains(&NodeId::new((*step).clone(), i.clone())))
            })
            .cloned()
            .collect();
        self.events.emit(RunEvent::JobFinished {
            failed_steps: failed_steps.clone(),
            at: chrono::Utc::now(),
        });

        if let Some(step) = failed_steps.first() {
            return Err(PipelineError::StepFailed { step: step.clone() });
        }
        Ok(RunSummary {
            completed,
            failed,
            job_dir: dirs.job_dir().to_path_buf(),
        })
    }
}
