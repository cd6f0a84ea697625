//! Builtin selector functions.
//!
//! Selector nodes do not run a tool; they look at the metrics their input
//! nodes reported and decide which upstream results flow forward. The
//! decision lands in `flowstatus.<step>.<index>.select` so downstream nodes
//! and the final report can see which variant won.

use std::fmt;
use std::str::FromStr;

use miette::Diagnostic;
use thiserror::Error;

use super::{FlowNode, Flowgraph, NodeId};
use crate::schema::{KeyStore, TypedValue};

/// Builtin selector policies a flow node can bind instead of a tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorKind {
    Minimum,
    Maximum,
    Join,
    Mux,
    Verify,
}

impl fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Minimum => "minimum",
            Self::Maximum => "maximum",
            Self::Join => "join",
            Self::Mux => "mux",
            Self::Verify => "verify",
        };
        f.write_str(name)
    }
}

impl FromStr for SelectorKind {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minimum" => Ok(Self::Minimum),
            "maximum" => Ok(Self::Maximum),
            "join" => Ok(Self::Join),
            "mux" => Ok(Self::Mux),
            "verify" => Ok(Self::Verify),
            other => Err(SelectorError::Unknown {
                name: other.to_string(),
            }),
        }
    }
}

/// Outcome of a selector run.
#[derive(Clone, Debug, PartialEq)]
pub struct Selection {
    /// Winning upstream node ids, in selection order.
    pub selected: Vec<NodeId>,
    /// Normalized score of the winner, for scoring selectors.
    pub score: Option<f64>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum SelectorError {
    #[error("unknown selector function: {name}")]
    #[diagnostic(
        code(fabflow::selector::unknown),
        help("Builtin selectors are minimum, maximum, join, mux, and verify.")
    )]
    Unknown { name: String },

    #[error("no input of {node} completed without error")]
    #[diagnostic(code(fabflow::selector::no_candidates))]
    NoCandidates { node: String },

    #[error("mux argument '{arg}' names no input node of {node}")]
    #[diagnostic(code(fabflow::selector::mux))]
    MuxUnknownNode { node: String, arg: String },

    #[error("malformed verify assertion '{assertion}'")]
    #[diagnostic(
        code(fabflow::selector::assertion),
        help("Assertions take the form <metric><op><bound>, e.g. errors==0 or setupwns>=0.")
    )]
    BadAssertion { assertion: String },

    #[error("verify assertion '{assertion}' failed for {node}")]
    #[diagnostic(code(fabflow::selector::verify))]
    VerifyFailed { node: String, assertion: String },
}

/// Run a selector on behalf of `node`, reading metrics and per-node status
/// from the store. Candidates are every declared index of every input step.
pub fn run_selector(
    kind: SelectorKind,
    store: &mut KeyStore,
    graph: &Flowgraph,
    node: &FlowNode,
) -> Result<Selection, SelectorError> {
    let candidates: Vec<NodeId> = node
        .inputs
        .keys()
        .flat_map(|step| {
            graph
                .indices(step)
                .into_iter()
                .map(|index| NodeId::new(step.clone(), index))
        })
        .collect();

    match kind {
        SelectorKind::Minimum => minmax(store, graph, node, &candidates, Goal::Minimize),
        SelectorKind::Maximum => minmax(store, graph, node, &candidates, Goal::Maximize),
        SelectorKind::Join => Ok(Selection {
            selected: candidates,
            score: None,
        }),
        SelectorKind::Mux => mux(node, &candidates),
        SelectorKind::Verify => verify(store, node, &candidates),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Goal {
    Minimize,
    Maximize,
}

/// Weighted normalized scoring over the candidate set.
///
/// Candidates that errored are out. If at least one survivor meets every
/// goal ceiling declared for it, survivors that miss a goal are out too;
/// when nobody meets the goals the scoring proceeds over all survivors
/// rather than selecting nothing. Each weighted metric is normalized to
/// `(real - min) / (max - min)`, with min/max taken over every non-errored
/// candidate; a degenerate spread contributes the shared value itself.
/// Ties go to the lexicographically smallest id so the result never
/// depends on completion order.
fn minmax(
    store: &mut KeyStore,
    graph: &Flowgraph,
    node: &FlowNode,
    candidates: &[NodeId],
    goal: Goal,
) -> Result<Selection, SelectorError> {
    let alive: Vec<&NodeId> = candidates
        .iter()
        .filter(|&id| !errored(store, id))
        .collect();
    if alive.is_empty() {
        return Err(SelectorError::NoCandidates {
            node: node.id.to_string(),
        });
    }

    // Per-metric bounds across every non-errored candidate; goal screening
    // below must not shift the normalization window.
    let mut bounds: Vec<(String, f64, f64)> = Vec::new();
    for &id in &alive {
        for metric in weighted_metrics(graph, id) {
            let Some(real) = metric_real(store, id, &metric) else {
                continue;
            };
            match bounds.iter_mut().find(|(m, _, _)| *m == metric) {
                Some((_, lo, hi)) => {
                    *lo = lo.min(real);
                    *hi = hi.max(real);
                }
                None => bounds.push((metric, real, real)),
            }
        }
    }

    let meets: Vec<bool> = alive.iter().map(|&id| meets_goals(store, id)).collect();
    let screened: Vec<&NodeId> = if meets.iter().any(|m| *m) {
        alive
            .iter()
            .zip(&meets)
            .filter_map(|(id, m)| m.then_some(*id))
            .collect()
    } else {
        tracing::warn!(node = %node.id, "no candidate meets its goals; scoring all survivors");
        alive
    };

    let mut best: Option<(f64, NodeId)> = None;
    for &id in &screened {
        let mut score = 0.0;
        if let Some(flow_node) = graph.node(id) {
            for (metric, weight) in &flow_node.weights {
                let Some(real) = metric_real(store, id, metric) else {
                    continue;
                };
                let Some((_, lo, hi)) = bounds.iter().find(|(m, _, _)| m == metric) else {
                    continue;
                };
                let normalized = if hi > lo { (real - lo) / (hi - lo) } else { *hi };
                score += weight * normalized;
            }
        }
        tracing::debug!(node = %node.id, candidate = %id, score, "selector score");
        let better = match &best {
            None => true,
            Some((best_score, best_id)) => match goal {
                Goal::Minimize => {
                    score < *best_score || (score == *best_score && id < best_id)
                }
                Goal::Maximize => {
                    score > *best_score || (score == *best_score && id < best_id)
                }
            },
        };
        if better {
            best = Some((score, id.clone()));
        }
    }

    let (score, winner) = best.ok_or_else(|| SelectorError::NoCandidates {
        node: node.id.to_string(),
    })?;
    Ok(Selection {
        selected: vec![winner],
        score: Some(score),
    })
}

/// Forward exactly the inputs named by the node's args, by id.
fn mux(node: &FlowNode, candidates: &[NodeId]) -> Result<Selection, SelectorError> {
    let mut selected = Vec::with_capacity(node.args.len());
    for arg in &node.args {
        let found = candidates
            .iter()
            .find(|id| id.to_string() == *arg)
            .ok_or_else(|| SelectorError::MuxUnknownNode {
                node: node.id.to_string(),
                arg: arg.clone(),
            })?;
        selected.push(found.clone());
    }
    Ok(Selection {
        selected,
        score: None,
    })
}

/// Assert metric bounds over every surviving candidate; any miss fails the
/// node.
fn verify(
    store: &mut KeyStore,
    node: &FlowNode,
    candidates: &[NodeId],
) -> Result<Selection, SelectorError> {
    let alive: Vec<NodeId> = candidates
        .iter()
        .filter(|&id| !errored(store, id))
        .cloned()
        .collect();
    if alive.is_empty() {
        return Err(SelectorError::NoCandidates {
            node: node.id.to_string(),
        });
    }
    for assertion in &node.args {
        let (metric, op, bound) = parse_assertion(assertion)?;
        for id in &alive {
            let real = metric_real(store, id, metric);
            let holds = real.is_some_and(|real| op.holds(real, bound));
            if !holds {
                return Err(SelectorError::VerifyFailed {
                    node: id.to_string(),
                    assertion: assertion.clone(),
                });
            }
        }
    }
    Ok(Selection {
        selected: alive,
        score: None,
    })
}

#[derive(Clone, Copy)]
enum CmpOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl CmpOp {
    fn holds(self, real: f64, bound: f64) -> bool {
        match self {
            Self::Lt => real < bound,
            Self::Le => real <= bound,
            Self::Eq => real == bound,
            Self::Ge => real >= bound,
            Self::Gt => real > bound,
        }
    }
}

fn parse_assertion(assertion: &str) -> Result<(&str, CmpOp, f64), SelectorError> {
    // Two-character operators have to win over their one-character prefixes.
    const OPS: &[(&str, CmpOp)] = &[
        ("<=", CmpOp::Le),
        (">=", CmpOp::Ge),
        ("==", CmpOp::Eq),
        ("<", CmpOp::Lt),
        (">", CmpOp::Gt),
    ];
    for (token, op) in OPS {
        if let Some(pos) = assertion.find(token) {
            let metric = assertion[..pos].trim();
            let bound = assertion[pos + token.len()..].trim();
            if metric.is_empty() {
                break;
            }
            let Ok(bound) = bound.parse::<f64>() else {
                break;
            };
            return Ok((metric, *op, bound));
        }
    }
    Err(SelectorError::BadAssertion {
        assertion: assertion.to_string(),
    })
}

fn errored(store: &mut KeyStore, id: &NodeId) -> bool {
    matches!(
        store.get(&["flowstatus", &id.step, &id.index, "error"]),
        TypedValue::Num(n) if n != 0.0
    )
}

/// True when every goal ceiling declared for the node's metrics is met by a
/// reported real value. An unset real with a declared goal counts as a miss.
fn meets_goals(store: &mut KeyStore, id: &NodeId) -> bool {
    for metric in store.getkeys(&["metric", &id.step, &id.index]) {
        let goal = store.get(&["metric", &id.step, &id.index, &metric, "goal"]);
        let TypedValue::Num(goal) = goal else {
            continue;
        };
        match metric_real(store, id, &metric) {
            Some(real) if real <= goal => {}
            _ => return false,
        }
    }
    true
}

fn weighted_metrics(graph: &Flowgraph, id: &NodeId) -> Vec<String> {
    graph
        .node(id)
        .map(|n| n.weights.keys().cloned().collect())
        .unwrap_or_default()
}

fn metric_real(store: &mut KeyStore, id: &NodeId, metric: &str) -> Option<f64> {
    match store.get(&["metric", &id.step, &id.index, metric, "real"]) {
        TypedValue::Num(n) => Some(n),
        _ => None,
    }
}
