//! Tool adapters and the compile-time tool registry.
//!
//! A [`ToolAdapter`] wraps one external executable: it declares the tool's
//! settings into the store before a run and harvests metrics out of the
//! working directory afterwards. Adapters are registered by name in a
//! [`ToolRegistry`] that the scheduler carries; binding a flow node to a
//! name absent from the registry is a runtime halt, not a link error, so
//! flows stay data-driven while the adapter set stays statically known.

use std::path::Path;
use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::flowgraph::NodeId;
use crate::schema::KeyStore;

#[derive(Debug, Error, Diagnostic)]
pub enum ToolError {
    #[error("tool '{tool}' setup failed: {message}")]
    #[diagnostic(code(fabflow::tool::setup))]
    Setup { tool: String, message: String },

    #[error("tool '{tool}' pre-process failed: {message}")]
    #[diagnostic(code(fabflow::tool::pre_process))]
    PreProcess { tool: String, message: String },

    #[error("tool '{tool}' post-process failed: {message}")]
    #[diagnostic(code(fabflow::tool::post_process))]
    PostProcess { tool: String, message: String },
}

/// Driver for one external tool.
///
/// Hooks run inside the step runner on the node's private manifest copy;
/// they configure and inspect, while process spawning stays with the
/// runner.
pub trait ToolAdapter: Send + Sync {
    /// Registry name; flow nodes bind to this string.
    fn name(&self) -> &str;

    /// Declare executable, options, scripts, and requirements under
    /// `tool.<name>.<step>.<index>.*` for the node about to run.
    fn setup(&self, store: &mut KeyStore, node: &NodeId) -> Result<(), ToolError>;

    /// Last-minute adjustments after inputs land in the workdir.
    fn pre_process(
        &self,
        _store: &mut KeyStore,
        _node: &NodeId,
        _workdir: &Path,
    ) -> Result<(), ToolError> {
        Ok(())
    }

    /// Harvest metrics and reports from the workdir. Returns the number of
    /// errors attributed to the tool run; non-zero fails the node unless
    /// its `continue` bit is set.
    fn post_process(
        &self,
        store: &mut KeyStore,
        node: &NodeId,
        workdir: &Path,
    ) -> Result<u64, ToolError>;

    /// Accept or reject the version string the executable reported.
    /// The default accepts when the report contains the required version.
    fn check_version(&self, required: &str, reported: &str) -> bool {
        reported.contains(required)
    }
}

/// Name-to-adapter table resolved once at scheduler construction.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    adapters: FxHashMap<String, Arc<dyn ToolAdapter>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name, replacing any previous
    /// binding.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) -> &mut Self {
        self.adapters.insert(adapter.name().to_string(), adapter);
        self
    }

    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn ToolAdapter>) -> Self {
        self.register(adapter);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("names", &self.names())
            .finish()
    }
}
