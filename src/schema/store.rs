//! The nested key-path configuration store and its accessor.
//!
//! A [`KeyStore`] holds one schema tree: branches are insertion-ordered maps
//! from key to child node, leaves are typed [`Parameter`]s. A branch may
//! carry a reserved `default` child whose subtree is a template; traversing
//! through a key that does not exist yet under such a branch deep-copies the
//! template into place. This is the only mechanism by which runtime-named
//! entries (step names, tool names, library names) enter the tree.
//!
//! The accessor is fail-soft: bad keypaths, type mismatches, and illegal
//! operations are recorded in the store's violation ledger and the call
//! degrades (reads return [`TypedValue::Unset`], writes become no-ops).
//! Callers batch-inspect the ledger via [`KeyStore::violations`] instead of
//! handling per-call errors; see [`crate::flowgraph::check`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::errors::{Violation, keypath_display};
use super::param::{ParamType, Parameter, RawValue, TypedValue};

/// Reserved branch key naming the dynamic-instantiation template.
pub const DEFAULT_KEY: &str = "default";

/// One node of the schema tree.
///
/// Serialized untagged: a leaf is recognized by its `type`/`defvalue`
/// fields, everything else deserializes as a branch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaNode {
    Leaf(Parameter),
    Branch(Branch),
}

impl SchemaNode {
    #[must_use]
    pub fn as_leaf(&self) -> Option<&Parameter> {
        match self {
            SchemaNode::Leaf(p) => Some(p),
            SchemaNode::Branch(_) => None,
        }
    }

    #[must_use]
    pub fn as_branch(&self) -> Option<&Branch> {
        match self {
            SchemaNode::Branch(b) => Some(b),
            SchemaNode::Leaf(_) => None,
        }
    }
}

/// An interior schema node: ordered children keyed by name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Branch {
    pub children: IndexMap<String, SchemaNode>,
}

impl Branch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_leaf(&mut self, key: impl Into<String>, param: Parameter) -> &mut Self {
        self.children.insert(key.into(), SchemaNode::Leaf(param));
        self
    }

    pub fn insert_branch(&mut self, key: impl Into<String>, branch: Branch) -> &mut Self {
        self.children.insert(key.into(), SchemaNode::Branch(branch));
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SchemaNode> {
        self.children.get(key)
    }

    /// Child keys in insertion order, `default` excluded.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.children
            .keys()
            .filter(|k| k.as_str() != DEFAULT_KEY)
            .cloned()
            .collect()
    }

    /// Resolve a path without instantiating templates. Read-only traversal
    /// used by merge/prune and serialization.
    #[must_use]
    pub fn node(&self, path: &[&str]) -> Option<&SchemaNode> {
        let (first, rest) = path.split_first()?;
        let node = self.children.get(*first)?;
        if rest.is_empty() {
            Some(node)
        } else {
            node.as_branch().and_then(|b| b.node(rest))
        }
    }

    /// Resolve a path, deep-copying `default` templates into place for every
    /// missing key along the way. Returns `None` when a key is missing and
    /// no template exists, or when the path descends through a leaf.
    pub fn node_mut(&mut self, path: &[&str]) -> Option<&mut SchemaNode> {
        let (first, rest) = path.split_first()?;
        if !self.children.contains_key(*first) {
            let template = self.children.get(DEFAULT_KEY)?.clone();
            self.children.insert((*first).to_string(), template);
        }
        let node = self.children.get_mut(*first)?;
        if rest.is_empty() {
            Some(node)
        } else {
            match node {
                SchemaNode::Branch(b) => b.node_mut(rest),
                SchemaNode::Leaf(_) => None,
            }
        }
    }

    /// All leaf keypaths below this branch, depth-first in key order.
    #[must_use]
    pub fn leaf_paths(&self) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        self.collect_leaf_paths(&mut prefix, &mut out);
        out
    }

    fn collect_leaf_paths(&self, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
        for (key, node) in &self.children {
            prefix.push(key.clone());
            match node {
                SchemaNode::Leaf(_) => out.push(prefix.clone()),
                SchemaNode::Branch(b) => b.collect_leaf_paths(prefix, out),
            }
            prefix.pop();
        }
    }
}

/// The configuration store: one schema tree plus the violation ledger.
///
/// All reads and writes go through the keypath accessor methods below.
/// Mutating accessors take `&mut self` because any traversal may instantiate
/// a `default` template subtree.
#[derive(Clone, Debug, Default)]
pub struct KeyStore {
    root: Branch,
    violations: Vec<Violation>,
}

impl KeyStore {
    /// An empty store with no schema. Most callers want
    /// [`crate::schema::defaults::default_schema`] instead.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_root(root: Branch) -> Self {
        Self {
            root,
            violations: Vec::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Branch {
        &self.root
    }

    #[must_use]
    pub fn root_mut(&mut self) -> &mut Branch {
        &mut self.root
    }

    /// Replace the tree wholesale, keeping the ledger.
    pub fn set_root(&mut self, root: Branch) {
        self.root = root;
    }

    // ------------------------------------------------------------------
    // Violation ledger
    // ------------------------------------------------------------------

    #[must_use]
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.violations.len()
    }

    pub fn record_violation(&mut self, violation: Violation) {
        tracing::error!(%violation, "schema violation");
        self.violations.push(violation);
    }

    pub fn take_violations(&mut self) -> Vec<Violation> {
        std::mem::take(&mut self.violations)
    }

    // ------------------------------------------------------------------
    // Keypath accessor
    // ------------------------------------------------------------------

    /// Read the coerced value at `keypath`.
    ///
    /// Unknown keypaths (and keypaths naming a branch) record a violation
    /// and read as [`TypedValue::Unset`].
    pub fn get(&mut self, keypath: &[&str]) -> TypedValue {
        tracing::trace!(keypath = %keypath_display(keypath), "get");
        match self.root.node_mut(keypath) {
            Some(SchemaNode::Leaf(p)) => p.read(),
            _ => {
                self.record_violation(Violation::MissingKeypath {
                    keypath: keypath_display(keypath),
                });
                TypedValue::Unset
            }
        }
    }

    /// Borrow the parameter at `keypath`, instantiating templates along the
    /// way. Missing keypaths record a violation.
    pub fn leaf(&mut self, keypath: &[&str]) -> Option<&Parameter> {
        match self.root.node_mut(keypath) {
            Some(SchemaNode::Leaf(_)) => {
                // Reborrow immutably; the template instantiation (if any)
                // already happened above.
                self.root.node(keypath).and_then(SchemaNode::as_leaf)
            }
            _ => {
                self.record_violation(Violation::MissingKeypath {
                    keypath: keypath_display(keypath),
                });
                None
            }
        }
    }

    /// The declared type of the parameter at `keypath`.
    pub fn param_type(&mut self, keypath: &[&str]) -> Option<ParamType> {
        self.leaf(keypath).map(|p| p.ptype)
    }

    /// Set the value at `keypath`, replacing any previous value.
    pub fn set(&mut self, keypath: &[&str], value: impl Into<RawValue>) {
        self.set_impl(keypath, value.into(), true);
    }

    /// Set-if-unset: a no-op when a non-empty value is already stored at
    /// `keypath`. A schema `defvalue` does not block the write. Used for
    /// environment defaults that must not destroy pre-set configuration.
    pub fn set_if_unset(&mut self, keypath: &[&str], value: impl Into<RawValue>) {
        self.set_impl(keypath, value.into(), false);
    }

    fn set_impl(&mut self, keypath: &[&str], value: RawValue, clobber: bool) {
        let path_str = keypath_display(keypath);
        tracing::debug!(keypath = %path_str, ?value, clobber, "set");
        let mut violation = None;
        match self.root.node_mut(keypath) {
            Some(SchemaNode::Leaf(p)) => {
                if p.lock {
                    tracing::debug!(keypath = %path_str, "ignoring set, lock bit is set");
                } else if let Err(reason) = p.typecheck(&value) {
                    violation = Some(Violation::TypeMismatch {
                        keypath: path_str,
                        expected: p.ptype.to_string(),
                        reason,
                    });
                } else if !clobber && p.value.as_ref().is_some_and(|v| !v.is_empty_list()) {
                    tracing::info!(
                        keypath = %path_str,
                        "ignoring set, value already set (clobber disabled)"
                    );
                } else {
                    p.value = Some(p.normalize(value));
                }
            }
            _ => {
                violation = Some(Violation::MissingKeypath { keypath: path_str });
            }
        }
        if let Some(v) = violation {
            self.record_violation(v);
        }
    }

    /// Append to the list parameter at `keypath`. Scalar parameters record
    /// an [`Violation::IllegalAdd`].
    pub fn add(&mut self, keypath: &[&str], value: impl Into<RawValue>) {
        let value = value.into();
        let path_str = keypath_display(keypath);
        tracing::debug!(keypath = %path_str, ?value, "add");
        let mut violation = None;
        match self.root.node_mut(keypath) {
            Some(SchemaNode::Leaf(p)) => {
                if p.lock {
                    tracing::debug!(keypath = %path_str, "ignoring add, lock bit is set");
                } else if !p.ptype.list {
                    violation = Some(Violation::IllegalAdd { keypath: path_str });
                } else if let Err(reason) = p.typecheck(&value) {
                    violation = Some(Violation::TypeMismatch {
                        keypath: path_str,
                        expected: p.ptype.to_string(),
                        reason,
                    });
                } else {
                    let mut items = match p.value.take().or_else(|| p.defvalue.clone()) {
                        Some(RawValue::List(items)) => items,
                        Some(RawValue::Scalar(s)) => vec![s],
                        None => Vec::new(),
                    };
                    match value {
                        RawValue::Scalar(s) => items.push(s),
                        RawValue::List(more) => items.extend(more),
                    }
                    p.value = Some(RawValue::List(items));
                }
            }
            _ => {
                violation = Some(Violation::MissingKeypath { keypath: path_str });
            }
        }
        if let Some(v) = violation {
            self.record_violation(v);
        }
    }

    /// Child keys of the branch at `keypath`, in insertion order and with
    /// the `default` template excluded. An empty keypath lists the root.
    pub fn getkeys(&mut self, keypath: &[&str]) -> Vec<String> {
        if keypath.is_empty() {
            return self.root.keys();
        }
        match self.root.node_mut(keypath) {
            Some(SchemaNode::Branch(b)) => b.keys(),
            _ => {
                self.record_violation(Violation::MissingKeypath {
                    keypath: keypath_display(keypath),
                });
                Vec::new()
            }
        }
    }

    /// All concrete leaf keypaths in the tree (templates included; callers
    /// that want only concrete entries filter on `default`).
    #[must_use]
    pub fn allkeys(&self) -> Vec<Vec<String>> {
        self.root.leaf_paths()
    }

    /// Deep copy of the subtree at `keypath`.
    pub fn getcfg(&mut self, keypath: &[&str]) -> Option<SchemaNode> {
        if keypath.is_empty() {
            return Some(SchemaNode::Branch(self.root.clone()));
        }
        match self.root.node_mut(keypath) {
            Some(node) => Some(node.clone()),
            None => {
                self.record_violation(Violation::MissingKeypath {
                    keypath: keypath_display(keypath),
                });
                None
            }
        }
    }

    /// Clear the value at `keypath`; subsequent reads fall back to
    /// `defvalue`. Locked parameters ignore the call like set/add do.
    pub fn unset(&mut self, keypath: &[&str]) {
        let mut violation = None;
        match self.root.node_mut(keypath) {
            Some(SchemaNode::Leaf(p)) => {
                if p.lock {
                    tracing::debug!(
                        keypath = %keypath_display(keypath),
                        "ignoring unset, lock bit is set"
                    );
                } else {
                    p.value = None;
                }
            }
            _ => {
                violation = Some(Violation::MissingKeypath {
                    keypath: keypath_display(keypath),
                });
            }
        }
        if let Some(v) = violation {
            self.record_violation(v);
        }
    }

    /// Set the lock bit on the parameter at `keypath`; subsequent set/add
    /// calls on that path are silently ignored.
    pub fn lock(&mut self, keypath: &[&str]) {
        let mut violation = None;
        match self.root.node_mut(keypath) {
            Some(SchemaNode::Leaf(p)) => p.lock = true,
            _ => {
                violation = Some(Violation::MissingKeypath {
                    keypath: keypath_display(keypath),
                });
            }
        }
        if let Some(v) = violation {
            self.record_violation(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::param::ScalarKind;

    fn store_with_template() -> KeyStore {
        let mut template = Branch::new();
        template.insert_leaf(
            "name",
            Parameter::new(ParamType::scalar(ScalarKind::Str)),
        );
        template.insert_leaf(
            "pins",
            Parameter::new(ParamType::list(ScalarKind::Str)),
        );
        let mut libs = Branch::new();
        libs.insert_branch(DEFAULT_KEY, template);
        let mut root = Branch::new();
        root.insert_branch("library", libs);
        KeyStore::from_root(root)
    }

    #[test]
    fn default_instantiation_is_independent_per_key() {
        let mut store = store_with_template();
        store.set(&["library", "nangate45", "name"], "nangate45");
        store.set(&["library", "sky130", "name"], "sky130");
        assert_eq!(
            store.get(&["library", "nangate45", "name"]),
            TypedValue::Str("nangate45".to_string())
        );
        assert_eq!(
            store.get(&["library", "sky130", "name"]),
            TypedValue::Str("sky130".to_string())
        );
        // default stays pristine and excluded from key listings
        assert_eq!(
            store.getkeys(&["library"]),
            vec!["nangate45".to_string(), "sky130".to_string()]
        );
        assert!(store.violations().is_empty());
    }

    #[test]
    fn missing_keypath_records_violation_and_degrades() {
        let mut store = store_with_template();
        assert!(store.get(&["library", "x", "nosuch"]).is_unset());
        assert_eq!(store.error_count(), 1);
    }

    #[test]
    fn type_mismatch_leaves_value_unchanged() {
        let mut root = Branch::new();
        root.insert_leaf("jobs", Parameter::new(ParamType::scalar(ScalarKind::Num)));
        let mut store = KeyStore::from_root(root);
        store.set(&["jobs"], "4");
        store.set(&["jobs"], "not-a-number");
        assert_eq!(store.get(&["jobs"]), TypedValue::Num(4.0));
        assert_eq!(store.error_count(), 1);
    }

    #[test]
    fn lock_makes_set_and_add_no_ops() {
        let mut root = Branch::new();
        root.insert_leaf(
            "sources",
            Parameter::new(ParamType::list(ScalarKind::File)),
        );
        let mut store = KeyStore::from_root(root);
        store.add(&["sources"], "top.v");
        store.lock(&["sources"]);
        for i in 0..100 {
            store.set(&["sources"], format!("clobber{i}.v"));
            store.add(&["sources"], format!("extra{i}.v"));
        }
        assert_eq!(
            store.get(&["sources"]).into_str_list(),
            vec!["top.v".to_string()]
        );
        assert!(store.violations().is_empty());
    }

    #[test]
    fn set_if_unset_respects_existing_value() {
        let mut root = Branch::new();
        root.insert_leaf("design", Parameter::new(ParamType::scalar(ScalarKind::Str)));
        let mut store = KeyStore::from_root(root);
        store.set(&["design"], "gcd");
        store.set_if_unset(&["design"], "other");
        assert_eq!(store.get(&["design"]), TypedValue::Str("gcd".to_string()));
        store.set(&["design"], "other");
        assert_eq!(store.get(&["design"]), TypedValue::Str("other".to_string()));
    }

    #[test]
    fn set_if_unset_ignores_schema_defaults() {
        let mut root = Branch::new();
        root.insert_leaf(
            "mode",
            Parameter::new(ParamType::scalar(ScalarKind::Str)).with_defvalue("asic"),
        );
        let mut store = KeyStore::from_root(root);
        // only a stored value blocks the write, not the schema default
        store.set_if_unset(&["mode"], "fpga");
        assert_eq!(store.get(&["mode"]), TypedValue::Str("fpga".to_string()));
        store.set_if_unset(&["mode"], "asic");
        assert_eq!(store.get(&["mode"]), TypedValue::Str("fpga".to_string()));
    }

    #[test]
    fn unset_restores_the_schema_default() {
        let mut root = Branch::new();
        root.insert_leaf(
            "mode",
            Parameter::new(ParamType::scalar(ScalarKind::Str)).with_defvalue("asic"),
        );
        let mut store = KeyStore::from_root(root);
        store.set(&["mode"], "fpga");
        store.unset(&["mode"]);
        assert_eq!(store.get(&["mode"]), TypedValue::Str("asic".to_string()));
        assert!(store.violations().is_empty());
    }

    #[test]
    fn add_on_scalar_is_a_violation() {
        let mut root = Branch::new();
        root.insert_leaf("design", Parameter::new(ParamType::scalar(ScalarKind::Str)));
        let mut store = KeyStore::from_root(root);
        store.add(&["design"], "gcd");
        assert_eq!(store.error_count(), 1);
        assert!(matches!(
            store.violations()[0],
            Violation::IllegalAdd { .. }
        ));
    }

    #[test]
    fn add_extends_defvalue_list() {
        let mut root = Branch::new();
        root.insert_leaf(
            "option",
            Parameter::new(ParamType::list(ScalarKind::Str)).with_defvalue(vec!["-quiet"]),
        );
        let mut store = KeyStore::from_root(root);
        store.add(&["option"], "-fast");
        assert_eq!(
            store.get(&["option"]).into_str_list(),
            vec!["-quiet".to_string(), "-fast".to_string()]
        );
    }
}
