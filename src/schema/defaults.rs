//! The built-in manifest schema.
//!
//! Every reserved keypath the orchestrator relies on is declared here:
//! flowgraph topology, per-node run status, metric tracking, provenance
//! records, per-tool settings, and job options. Subtrees keyed by runtime
//! names (steps, indices, tools, metrics) are declared through `default`
//! templates and instantiated on first access.

use super::param::{ParamType, Parameter, ScalarKind};
use super::store::{Branch, DEFAULT_KEY, KeyStore};

/// Metric names tracked per flow node. `runtime` is always recorded by the
/// step runner; the rest are populated by tool post-process hooks.
pub const METRICS: &[&str] = &[
    "errors", "warnings", "drv", "area", "power", "leakage", "setupwns", "holdwns", "runtime",
];

/// Provenance fields recorded per completed flow node.
pub const RECORD_FIELDS: &[&str] =
    &["starttime", "endtime", "author", "userid", "machine", "version"];

/// Build a [`KeyStore`] seeded with the complete built-in schema.
#[must_use]
pub fn default_schema() -> KeyStore {
    let mut root = Branch::new();
    root.insert_branch("flowgraph", flowgraph_schema());
    root.insert_branch("flowstatus", flowstatus_schema());
    root.insert_branch("metric", metric_schema());
    root.insert_branch("record", record_schema());
    root.insert_branch("tool", tool_schema());
    options_schema(&mut root);
    KeyStore::from_root(root)
}

fn str_param(short_help: &str) -> Parameter {
    Parameter::new(ParamType::scalar(ScalarKind::Str)).with_short_help(short_help)
}

fn num_param(short_help: &str) -> Parameter {
    Parameter::new(ParamType::scalar(ScalarKind::Num)).with_short_help(short_help)
}

fn bool_param(short_help: &str) -> Parameter {
    Parameter::new(ParamType::scalar(ScalarKind::Bool))
        .with_defvalue(false)
        .with_short_help(short_help)
}

fn strlist_param(short_help: &str) -> Parameter {
    Parameter::new(ParamType::list(ScalarKind::Str)).with_short_help(short_help)
}

/// `flowgraph.<step>.<index>.{input.<instep>, tool, function, args,
/// weight.<metric>, goal.<metric>}`
fn flowgraph_schema() -> Branch {
    let mut node = Branch::new();

    let mut input = Branch::new();
    input.insert_leaf(
        DEFAULT_KEY,
        strlist_param("Indices of the named input step this node depends on"),
    );
    node.insert_branch("input", input);

    node.insert_leaf(
        "tool",
        str_param("External tool bound to this node").with_switch("-flow_tool"),
    );
    node.insert_leaf(
        "function",
        str_param("Builtin selector bound to this node (exclusive with tool)"),
    );
    node.insert_leaf("args", strlist_param("Arguments passed to the builtin selector"));

    let mut weight = Branch::new();
    weight.insert_leaf(
        DEFAULT_KEY,
        num_param("Scoring weight for the named metric"),
    );
    node.insert_branch("weight", weight);

    let mut goal = Branch::new();
    goal.insert_leaf(DEFAULT_KEY, num_param("Ceiling the named metric must not exceed"));
    node.insert_branch("goal", goal);

    branch_with_default(branch_with_default(node))
}

/// `flowstatus.<step>.<index>.{select, error}`
fn flowstatus_schema() -> Branch {
    let mut node = Branch::new();
    node.insert_leaf(
        "select",
        strlist_param("Upstream node ids selected as inputs"),
    );
    node.insert_leaf(
        "error",
        num_param("Completion status, 1 while failed/unfinished").with_defvalue(0.0),
    );
    branch_with_default(branch_with_default(node))
}

/// `metric.<step>.<index>.<metric>.{real, goal}`
fn metric_schema() -> Branch {
    let mut per_index = Branch::new();
    for metric in METRICS {
        let mut fields = Branch::new();
        fields.insert_leaf("real", num_param("Measured metric value"));
        fields.insert_leaf("goal", num_param("Target metric value"));
        per_index.insert_branch(*metric, fields);
    }
    branch_with_default(branch_with_default(per_index))
}

/// `record.<step>.<index>.<field>`
fn record_schema() -> Branch {
    let mut fields = Branch::new();
    for field in RECORD_FIELDS {
        fields.insert_leaf(*field, str_param("Provenance record"));
    }
    branch_with_default(branch_with_default(fields))
}

/// `tool.<name>.<step>.<index>.{exe, version, vswitch, option, format,
/// script, refdir, copy, continue, req}`
fn tool_schema() -> Branch {
    let mut node = Branch::new();
    node.insert_leaf("exe", str_param("Executable name or path"));
    node.insert_leaf("version", str_param("Required executable version"));
    node.insert_leaf(
        "vswitch",
        str_param("Switch that makes the executable print its version"),
    );
    node.insert_leaf("option", strlist_param("Command line options"));
    node.insert_leaf(
        "format",
        str_param("Manifest encoding the tool sources (json, yaml, tcl)"),
    );
    node.insert_leaf(
        "script",
        Parameter::new(ParamType::list(ScalarKind::File))
            .with_short_help("Entry point scripts passed to the executable"),
    );
    node.insert_leaf(
        "refdir",
        Parameter::new(ParamType::scalar(ScalarKind::Dir))
            .with_short_help("Reference script directory copied into the workdir"),
    );
    node.insert_leaf("copy", bool_param("Copy the reference directory before running"));
    node.insert_leaf(
        "continue",
        bool_param("Tolerate a non-zero exit from the executable"),
    );
    node.insert_leaf(
        "req",
        strlist_param("Comma-joined keypaths that must be set before running"),
    );
    branch_with_default(branch_with_default(branch_with_default(node)))
}

fn options_schema(root: &mut Branch) {
    root.insert_leaf(
        "design",
        str_param("Top level design name")
            .with_switch("-design")
            .with_requirement("all"),
    );
    root.insert_leaf(
        "mode",
        str_param("Compilation mode")
            .with_switch("-mode")
            .with_defvalue("asic"),
    );
    root.insert_leaf(
        "dir",
        Parameter::new(ParamType::scalar(ScalarKind::Dir))
            .with_switch("-dir")
            .with_defvalue("build")
            .with_short_help("Build directory root"),
    );
    root.insert_leaf(
        "jobname",
        str_param("Job name prefix").with_defvalue("job"),
    );
    root.insert_leaf("jobid", num_param("Job id suffix").with_defvalue(0.0));
    root.insert_leaf(
        "steplist",
        strlist_param("Steps to execute; all flowgraph steps when empty"),
    );
    root.insert_leaf("quiet", bool_param("Suppress tool stdout mirroring"));
    root.insert_leaf("userid", str_param("User identity for provenance records"));
    root.insert_leaf("machine", str_param("Host identity for provenance records"));

    let mut arg = Branch::new();
    arg.insert_leaf("step", str_param("Step scratch argument for tool scripts"));
    arg.insert_leaf("index", str_param("Index scratch argument for tool scripts"));
    root.insert_branch("arg", arg);

    let mut remote = Branch::new();
    remote.insert_leaf("addr", str_param("Remote dispatch address"));
    remote.insert_leaf("port", num_param("Remote dispatch port"));
    root.insert_branch("remote", remote);
}

/// Wrap a subtree so it instantiates under a runtime-chosen key.
fn branch_with_default(template: Branch) -> Branch {
    let mut outer = Branch::new();
    outer.insert_branch(DEFAULT_KEY, template);
    outer
}
