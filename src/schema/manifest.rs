//! Manifest persistence: one tree, three encodings.
//!
//! The structured forms (JSON, YAML) preserve the full per-leaf parameter
//! schema and round-trip losslessly. The Tcl script form is a flat sequence
//! of `dict set` statements for tools that can only source a script; it
//! resolves `$VAR` placeholders into Tcl's `$env(VAR)` lookup syntax and is
//! write-only.

use std::path::Path;

use miette::Diagnostic;
use thiserror::Error;

use super::merge::prune;
use super::param::RawValue;
use super::store::{Branch, SchemaNode};

/// Name stem used for per-node manifest snapshots.
pub const MANIFEST_STEM: &str = "fab_manifest";

/// Tcl dict variable the script form populates.
const TCL_DICT: &str = "fab_cfg";

#[derive(Debug, Error, Diagnostic)]
pub enum ManifestError {
    #[error("manifest io error for {path}: {source}")]
    #[diagnostic(code(fabflow::manifest::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest json error: {0}")]
    #[diagnostic(code(fabflow::manifest::json))]
    Json(#[from] serde_json::Error),

    #[error("manifest yaml error: {0}")]
    #[diagnostic(code(fabflow::manifest::yaml))]
    Yaml(#[from] serde_yaml::Error),

    #[error("unrecognized manifest format: {path}")]
    #[diagnostic(
        code(fabflow::manifest::format),
        help("Supported extensions are .json, .yaml/.yml, and .tcl (write-only).")
    )]
    UnknownFormat { path: String },
}

/// Serialization options for [`write_manifest`].
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// Prune templates, annotations, and unset leaves first.
    pub prune: bool,
    /// Keep empty lists while pruning (Tcl consumers want them declared).
    pub keep_lists: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            prune: true,
            keep_lists: false,
        }
    }
}

/// Write `tree` to `path`, choosing the encoding from the file extension.
pub fn write_manifest(tree: &Branch, path: &Path, options: WriteOptions) -> Result<(), ManifestError> {
    let path_str = path.display().to_string();
    tracing::debug!(path = %path_str, ?options, "writing manifest");

    let pruned;
    let tree = if options.prune {
        pruned = prune(tree, options.keep_lists);
        &pruned
    } else {
        tree
    };

    let rendered = match extension(path) {
        Some("json") => serde_json::to_string_pretty(tree)? + "\n",
        Some("yaml") | Some("yml") => serde_yaml::to_string(tree)?,
        Some("tcl") => render_tcl(tree),
        _ => return Err(ManifestError::UnknownFormat { path: path_str }),
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|source| ManifestError::Io {
            path: path_str.clone(),
            source,
        })?;
    }
    std::fs::write(path, rendered).map_err(|source| ManifestError::Io {
        path: path_str,
        source,
    })
}

/// Read a structured manifest (JSON or YAML) back into a tree.
pub fn read_manifest(path: &Path) -> Result<Branch, ManifestError> {
    let path_str = path.display().to_string();
    tracing::debug!(path = %path_str, "reading manifest");
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path_str.clone(),
        source,
    })?;
    match extension(path) {
        Some("json") => Ok(serde_json::from_str(&text)?),
        Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&text)?),
        _ => Err(ManifestError::UnknownFormat { path: path_str }),
    }
}

/// Snapshot `tree` into all supported encodings under `dir`, named
/// `fab_manifest.{json,yaml,tcl}`. The Tcl form keeps empty lists so tools
/// see every parameter declared.
pub fn snapshot_all_formats(tree: &Branch, dir: &Path) -> Result<(), ManifestError> {
    write_manifest(tree, &dir.join(format!("{MANIFEST_STEM}.json")), WriteOptions::default())?;
    write_manifest(tree, &dir.join(format!("{MANIFEST_STEM}.yaml")), WriteOptions::default())?;
    write_manifest(
        tree,
        &dir.join(format!("{MANIFEST_STEM}.tcl")),
        WriteOptions {
            prune: true,
            keep_lists: true,
        },
    )
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}

fn render_tcl(tree: &Branch) -> String {
    let mut out = String::new();
    out.push_str("#############################################\n");
    out.push_str("# AUTO-GENERATED MANIFEST. DO NOT EDIT.\n");
    out.push_str("#############################################\n");
    let mut keys = Vec::new();
    render_tcl_branch(tree, &mut keys, &mut out);
    out
}

fn render_tcl_branch(branch: &Branch, keys: &mut Vec<String>, out: &mut String) {
    for (key, node) in &branch.children {
        keys.push(key.clone());
        match node {
            SchemaNode::Leaf(p) => {
                let items: Vec<String> = match p.effective() {
                    None => Vec::new(),
                    Some(RawValue::Scalar(s)) => vec![tcl_value(s)],
                    Some(RawValue::List(list)) => list.iter().map(|s| tcl_value(s)).collect(),
                };
                out.push_str(&format!(
                    "dict set {TCL_DICT} {} [list {}]\n",
                    keys.join(" "),
                    items.join(" ")
                ));
            }
            SchemaNode::Branch(b) => render_tcl_branch(b, keys, out),
        }
        keys.pop();
    }
}

/// Rewrite a leading `$VAR` into `$env(VAR)` and escape statement
/// separators, per Tcl sourcing rules.
fn tcl_value(value: &str) -> String {
    let rewritten = match value.strip_prefix('$') {
        Some(rest) => {
            let var_len = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            if var_len == 0 {
                value.to_string()
            } else {
                format!("$env({}){}", &rest[..var_len], &rest[var_len..])
            }
        }
        None => value.to_string(),
    };
    rewritten.replace(';', "\\;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::param::{ParamType, Parameter, ScalarKind};

    fn small_tree() -> Branch {
        let mut root = Branch::new();
        let mut design = Parameter::new(ParamType::scalar(ScalarKind::Str));
        design.value = Some("gcd".into());
        root.insert_leaf("design", design);
        let mut sources = Parameter::new(ParamType::list(ScalarKind::File));
        sources.value = Some(vec!["$PDK_HOME/cells.lef", "gcd.v"].into());
        let mut asic = Branch::new();
        asic.insert_leaf("sources", sources);
        root.insert_branch("asic", asic);
        root
    }

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let tree = small_tree();
        write_manifest(&tree, &path, WriteOptions::default()).unwrap();
        let back = read_manifest(&path).unwrap();
        assert_eq!(prune(&tree, false), back);
    }

    #[test]
    fn yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.yaml");
        let tree = small_tree();
        write_manifest(&tree, &path, WriteOptions::default()).unwrap();
        let back = read_manifest(&path).unwrap();
        assert_eq!(prune(&tree, false), back);
    }

    #[test]
    fn tcl_form_rewrites_env_vars() {
        let rendered = render_tcl(&small_tree());
        assert!(rendered.contains("dict set fab_cfg design [list gcd]"));
        assert!(rendered.contains("$env(PDK_HOME)/cells.lef"));
    }

    #[test]
    fn tcl_escapes_separators() {
        assert_eq!(tcl_value("a;b"), "a\\;b");
        assert_eq!(tcl_value("$X_1/lib"), "$env(X_1)/lib");
        assert_eq!(tcl_value("plain"), "plain");
    }
}
