use std::path::Path;

use fabflow::flowgraph::NodeId;
use fabflow::runtime::{ToolAdapter, ToolError};
use fabflow::schema::{KeyStore, default_schema};

/// Metric hook signature for [`ShellTool`].
pub type MetricFn = fn(&NodeId) -> Vec<(&'static str, f64)>;

pub fn no_metrics(_: &NodeId) -> Vec<(&'static str, f64)> {
    Vec::new()
}

/// Adapter that runs `sh -c <command>`, with `{step}` and `{index}`
/// substituted at setup time. Metrics reported by `metrics` are written
/// during post-process, the way a real adapter harvests a tool log.
pub struct ShellTool {
    pub tool_name: &'static str,
    pub command: &'static str,
    pub metrics: MetricFn,
    pub tolerate_failure: bool,
}

impl ShellTool {
    pub fn new(tool_name: &'static str, command: &'static str) -> Self {
        Self {
            tool_name,
            command,
            metrics: no_metrics,
            tolerate_failure: false,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricFn) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn tolerant(mut self) -> Self {
        self.tolerate_failure = true;
        self
    }
}

impl ToolAdapter for ShellTool {
    fn name(&self) -> &str {
        self.tool_name
    }

    fn setup(&self, store: &mut KeyStore, node: &NodeId) -> Result<(), ToolError> {
        let command = self
            .command
            .replace("{step}", &node.step)
            .replace("{index}", &node.index);
        store.set(
            &["tool", self.tool_name, &node.step, &node.index, "exe"],
            "sh",
        );
        store.set(
            &["tool", self.tool_name, &node.step, &node.index, "version"],
            "any",
        );
        store.set(
            &["tool", self.tool_name, &node.step, &node.index, "option"],
            vec!["-c".to_string(), command],
        );
        if self.tolerate_failure {
            store.set(
                &["tool", self.tool_name, &node.step, &node.index, "continue"],
                true,
            );
        }
        Ok(())
    }

    fn post_process(
        &self,
        store: &mut KeyStore,
        node: &NodeId,
        _workdir: &Path,
    ) -> Result<u64, ToolError> {
        for (metric, value) in (self.metrics)(node) {
            store.set(&["metric", &node.step, &node.index, metric, "real"], value);
        }
        Ok(0)
    }
}

/// Adapter exercising the version probe: the executable is `echo`, so the
/// probe reports exactly `reported` and the runner compares it against
/// `required`.
pub struct VersionTool {
    pub tool_name: &'static str,
    pub required: &'static str,
    pub reported: &'static str,
}

impl ToolAdapter for VersionTool {
    fn name(&self) -> &str {
        self.tool_name
    }

    fn setup(&self, store: &mut KeyStore, node: &NodeId) -> Result<(), ToolError> {
        store.set(
            &["tool", self.tool_name, &node.step, &node.index, "exe"],
            "echo",
        );
        store.set(
            &["tool", self.tool_name, &node.step, &node.index, "version"],
            self.required,
        );
        store.set(
            &["tool", self.tool_name, &node.step, &node.index, "vswitch"],
            self.reported,
        );
        Ok(())
    }

    fn post_process(
        &self,
        _store: &mut KeyStore,
        _node: &NodeId,
        _workdir: &Path,
    ) -> Result<u64, ToolError> {
        Ok(0)
    }
}

/// A schema store pointed at a scratch build directory.
pub fn base_store(dir: &Path, design: &str) -> KeyStore {
    let mut store = default_schema();
    store.set(&["design"], design);
    store.set(&["dir"], dir.to_str().unwrap());
    store
}

/// Declare a linear chain of single-index steps, each bound to its tool.
pub fn chain(store: &mut KeyStore, steps: &[(&str, &str)]) {
    let mut prev: Option<&str> = None;
    for (step, tool) in steps {
        store.set(&["flowgraph", step, "0", "tool"], *tool);
        if let Some(prev) = prev {
            store.add(&["flowgraph", step, "0", "input", prev], "0");
        }
        prev = Some(step);
    }
}
