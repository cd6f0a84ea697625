//! Flowgraph model: the execution DAG read out of the manifest.
//!
//! A flow node is a `(step, index)` pair with declared input edges, a tool
//! or builtin-selector binding, and per-metric weights and goals. The model
//! is a read-side projection of the `flowgraph.*` subtree of the
//! [`KeyStore`](crate::schema::KeyStore); mutating the store does not
//! retroactively update an extracted [`Flowgraph`].

pub mod selectors;

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::schema::errors::Violation;
use crate::schema::{KeyStore, TypedValue};

pub use selectors::{Selection, SelectorError, SelectorKind, run_selector};

/// Identifier of one flow node: a step name plus a variant index.
///
/// Renders as the concatenated `<step><index>` form used for working
/// directory names and select lists.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub step: String,
    pub index: String,
}

impl NodeId {
    #[must_use]
    pub fn new(step: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            index: index.into(),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.step, self.index)
    }
}

/// One node of the flowgraph, as declared in the manifest.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowNode {
    pub id: NodeId,
    /// Dependency edges: input step name to the indices consumed from it.
    pub inputs: IndexMap<String, Vec<String>>,
    /// External tool binding; mutually exclusive with `function`.
    pub tool: Option<String>,
    /// Builtin selector binding; mutually exclusive with `tool`.
    pub function: Option<SelectorKind>,
    /// Arguments for args-driven selectors (mux, verify).
    pub args: Vec<String>,
    /// Scoring weights per metric name.
    pub weights: IndexMap<String, f64>,
    /// Goal ceilings per metric name.
    pub goals: IndexMap<String, f64>,
}

impl FlowNode {
    /// Every (step, index) this node waits on, in declaration order.
    #[must_use]
    pub fn input_ids(&self) -> Vec<NodeId> {
        self.inputs
            .iter()
            .flat_map(|(step, indices)| {
                indices.iter().map(|i| NodeId::new(step.clone(), i.clone()))
            })
            .collect()
    }
}

/// Projection of the `flowgraph.*` subtree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Flowgraph {
    nodes: IndexMap<NodeId, FlowNode>,
}

impl Flowgraph {
    /// Read the flowgraph out of the store. Unparseable `function` names are
    /// left unbound here and surface later as validation or runtime errors.
    pub fn from_store(store: &mut KeyStore) -> Self {
        let mut nodes = IndexMap::new();
        for step in store.getkeys(&["flowgraph"]) {
            for index in store.getkeys(&["flowgraph", &step]) {
                let id = NodeId::new(step.clone(), index.clone());

                let mut inputs = IndexMap::new();
                for in_step in store.getkeys(&["flowgraph", &step, &index, "input"]) {
                    let indices = store
                        .get(&["flowgraph", &step, &index, "input", &in_step])
                        .into_str_list();
                    inputs.insert(in_step, indices);
                }

                let tool = store
                    .get(&["flowgraph", &step, &index, "tool"])
                    .as_str()
                    .map(str::to_string);
                let function = store
                    .get(&["flowgraph", &step, &index, "function"])
                    .as_str()
                    .and_then(|name| name.parse().ok());
                let args = store
                    .get(&["flowgraph", &step, &index, "args"])
                    .into_str_list();

                let mut weights = IndexMap::new();
                for metric in store.getkeys(&["flowgraph", &step, &index, "weight"]) {
                    if let TypedValue::Num(w) =
                        store.get(&["flowgraph", &step, &index, "weight", &metric])
                    {
                        weights.insert(metric, w);
                    }
                }
                let mut goals = IndexMap::new();
                for metric in store.getkeys(&["flowgraph", &step, &index, "goal"]) {
                    if let TypedValue::Num(g) =
                        store.get(&["flowgraph", &step, &index, "goal", &metric])
                    {
                        goals.insert(metric, g);
                    }
                }

                nodes.insert(
                    id.clone(),
                    FlowNode {
                        id,
                        inputs,
                        tool,
                        function,
                        args,
                        weights,
                        goals,
                    },
                );
            }
        }
        Self { nodes }
    }

    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&FlowNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes.values()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Step names in declaration order, deduplicated.
    #[must_use]
    pub fn step_names(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for id in self.nodes.keys() {
            if !out.contains(&id.step) {
                out.push(id.step.clone());
            }
        }
        out
    }

    /// Declared indices of a step, in declaration order.
    #[must_use]
    pub fn indices(&self, step: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|id| id.step == step)
            .map(|id| id.index.clone())
            .collect()
    }

    /// Steps ordered by maximum dependency-path length, ascending; steps
    /// with longer chains behind them sort later. Ties keep declaration
    /// order (the sort is stable). Cycles contribute depth zero here and
    /// are reported by [`Flowgraph::validate`].
    #[must_use]
    pub fn steps(&self) -> Vec<String> {
        let mut steps = self.step_names();
        let depths: IndexMap<String, usize> = steps
            .iter()
            .map(|step| {
                let depth = self
                    .indices(step)
                    .into_iter()
                    .map(|index| self.depth(&NodeId::new(step.clone(), index), &mut Vec::new()))
                    .max()
                    .unwrap_or(0);
                (step.clone(), depth)
            })
            .collect();
        steps.sort_by_key(|step| depths[step]);
        steps
    }

    fn depth(&self, id: &NodeId, stack: &mut Vec<NodeId>) -> usize {
        if stack.contains(id) {
            return 0; // cycle; validate() reports it
        }
        let Some(node) = self.nodes.get(id) else {
            return 0;
        };
        stack.push(id.clone());
        let depth = node
            .input_ids()
            .iter()
            .map(|input| 1 + self.depth(input, stack))
            .max()
            .unwrap_or(0);
        stack.pop();
        depth
    }

    /// Structural validation: every input edge references a declared step,
    /// and the graph is acyclic.
    #[must_use]
    pub fn validate(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        let steps = self.step_names();
        for node in self.nodes.values() {
            for input_step in node.inputs.keys() {
                if !steps.contains(input_step) {
                    violations.push(Violation::FlowgraphReference {
                        step: node.id.step.clone(),
                        input: input_step.clone(),
                    });
                }
            }
        }
        for step in &steps {
            if self.step_in_cycle(step) {
                violations.push(Violation::FlowgraphCycle { step: step.clone() });
            }
        }
        violations
    }

    fn step_in_cycle(&self, step: &str) -> bool {
        for index in self.indices(step) {
            let start = NodeId::new(step.to_string(), index);
            let mut stack = vec![start.clone()];
            if self.reaches(&start, &start, &mut stack) {
                return true;
            }
        }
        false
    }

    fn reaches(&self, from: &NodeId, target: &NodeId, seen: &mut Vec<NodeId>) -> bool {
        let Some(node) = self.nodes.get(from) else {
            return false;
        };
        for input in node.input_ids() {
            if &input == target {
                return true;
            }
            if seen.contains(&input) {
                continue;
            }
            seen.push(input.clone());
            if self.reaches(&input, target, seen) {
                return true;
            }
        }
        false
    }
}

/// Validation pass over the store and flowgraph.
///
/// Checks flowgraph structure, global/mode requirements, and the declared
/// tool requirements of every node in `nodes`. Violations are returned as
/// a batch; nothing short-circuits, so a single pass reports every problem
/// at once.
pub fn check(store: &mut KeyStore, graph: &Flowgraph, nodes: &[NodeId]) -> Vec<Violation> {
    let mut violations = graph.validate();

    let mode = store
        .get(&["mode"])
        .as_str()
        .map(str::to_string)
        .unwrap_or_default();

    // Requirement scan over every concrete leaf.
    for keypath in store.allkeys() {
        if keypath.iter().any(|k| k == crate::schema::DEFAULT_KEY) {
            continue;
        }
        let path: Vec<&str> = keypath.iter().map(String::as_str).collect();
        let Some(leaf) = store.leaf(&path) else {
            continue;
        };
        let Some(requirement) = leaf.requirement.clone() else {
            continue;
        };
        if (requirement == "all" || requirement == mode) && leaf.is_empty(false) {
            violations.push(Violation::RequirementMissing {
                keypath: keypath.join("."),
                requirement,
            });
        }
    }

    for id in nodes {
        if let Some(flow_node) = graph.node(id)
            && let Some(tool) = flow_node.tool.clone()
        {
            check_tool(store, &tool, id, &mut violations);
        }
    }

    violations
}

fn check_tool(store: &mut KeyStore, tool: &str, id: &NodeId, violations: &mut Vec<Violation>) {
    let required = store
        .get(&["tool", tool, &id.step, &id.index, "req"])
        .into_str_list();
    for item in required {
        let keypath: Vec<&str> = item.split(',').collect();
        if keypath_empty(store, &keypath) {
            violations.push(Violation::ToolRequirementMissing {
                tool: tool.to_string(),
                step: id.step.clone(),
                index: id.index.clone(),
                keypath: keypath.join("."),
            });
        }
    }
    for field in ["exe", "version"] {
        if keypath_empty(store, &["tool", tool, &id.step, &id.index, field]) {
            violations.push(Violation::ToolRequirementMissing {
                tool: tool.to_string(),
                step: id.step.clone(),
                index: id.index.clone(),
                keypath: format!("tool.{tool}.{}.{}.{field}", id.step, id.index),
            });
        }
    }
}

/// Read-only emptiness probe: unknown keypaths count as empty without
/// recording a missing-keypath violation of their own.
fn keypath_empty(store: &KeyStore, keypath: &[&str]) -> bool {
    match store.root().node(keypath) {
        Some(crate::schema::SchemaNode::Leaf(p)) => p.is_empty(false),
        _ => true,
    }
}
