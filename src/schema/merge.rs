//! Tree merge and prune for manifest exchange.
//!
//! `merge` lays an overlay tree onto a base tree (the config-overlay and
//! result-adoption path); `prune` strips templates, annotations, and unset
//! leaves before a tree is serialized. Both are pure functions over
//! [`Branch`] trees so they compose with the accessor without borrowing a
//! whole [`KeyStore`](crate::schema::KeyStore).

use super::param::RawValue;
use super::store::{Branch, DEFAULT_KEY, SchemaNode};

/// Merge policy for list-typed parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    /// Overlay values replace base values.
    #[default]
    Replace,
    /// Overlay list values are appended to base list values.
    Append,
}

/// Copy every concrete (non-`default`) leaf value of `overlay` into `base`.
///
/// Keys present only in `base` are never deleted. Leaves missing from `base`
/// are instantiated from `base`'s templates where possible; where `base` has
/// no matching schema the overlay leaf is grafted in verbatim, so a manifest
/// read back from disk survives a round-trip even if the local schema is
/// older than the writer's.
pub fn merge(base: &mut Branch, overlay: &Branch, mode: MergeMode) {
    merge_branch(base, overlay, mode);
}

fn merge_branch(base: &mut Branch, overlay: &Branch, mode: MergeMode) {
    for (key, overlay_node) in &overlay.children {
        if key == DEFAULT_KEY {
            continue;
        }
        if !base.children.contains_key(key) {
            if let Some(template) = base.children.get(DEFAULT_KEY) {
                let instance = template.clone();
                base.children.insert(key.clone(), instance);
            } else {
                base.children.insert(key.clone(), overlay_node.clone());
                continue;
            }
        }
        match (base.children.get_mut(key), overlay_node) {
            (Some(SchemaNode::Branch(b)), SchemaNode::Branch(o)) => merge_branch(b, o, mode),
            (Some(SchemaNode::Leaf(b)), SchemaNode::Leaf(o)) => {
                let Some(value) = o.value.clone() else {
                    continue;
                };
                match (mode, &mut b.value, value) {
                    (MergeMode::Append, Some(RawValue::List(existing)), RawValue::List(new)) => {
                        existing.extend(new);
                    }
                    (_, slot, value) => *slot = Some(value),
                }
            }
            // Shape conflict between the trees: the overlay wins, matching
            // the leaf-copy semantics above.
            (Some(slot), overlay_node) => *slot = overlay_node.clone(),
            (None, _) => unreachable!("key inserted above"),
        }
    }
}

/// Strip a tree down to its serializable, concrete content.
///
/// Removes every `default` template subtree, the `help`/`example`
/// annotation fields, every leaf whose value and defvalue are both empty
/// (`{unset, []}`, or just `{unset}` with `keep_lists`), and any branch
/// left childless. Runs to a bounded fixed point since deleting a child can
/// empty a now-prunable parent.
#[must_use]
pub fn prune(tree: &Branch, keep_lists: bool) -> Branch {
    let mut local = tree.clone();
    // Bounded pass count instead of a depth-tracked worklist; deeper schemas
    // than this do not occur in practice.
    for _ in 0..10 {
        if !prune_pass(&mut local, keep_lists) {
            break;
        }
    }
    local
}

/// One prune sweep; returns true when anything was removed.
fn prune_pass(branch: &mut Branch, keep_lists: bool) -> bool {
    let mut changed = false;
    branch.children.retain(|key, node| {
        if key == DEFAULT_KEY {
            changed = true;
            return false;
        }
        match node {
            SchemaNode::Leaf(p) => {
                if p.help.take().is_some() | !std::mem::take(&mut p.example).is_empty() {
                    changed = true;
                }
                if p.is_empty(keep_lists) {
                    changed = true;
                    false
                } else {
                    true
                }
            }
            SchemaNode::Branch(b) => {
                changed |= prune_pass(b, keep_lists);
                if b.children.is_empty() {
                    changed = true;
                    false
                } else {
                    true
                }
            }
        }
    });
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::KeyStore;
    use crate::schema::param::{ParamType, Parameter, ScalarKind, TypedValue};

    fn populated_store() -> KeyStore {
        let mut template = Branch::new();
        template.insert_leaf(
            "corner",
            Parameter::new(ParamType::scalar(ScalarKind::Str)).with_help("corner name"),
        );
        template.insert_leaf(
            "voltage",
            Parameter::new(ParamType::scalar(ScalarKind::Num)),
        );
        let mut scenarios = Branch::new();
        scenarios.insert_branch(DEFAULT_KEY, template);
        let mut root = Branch::new();
        root.insert_branch("mcmm", scenarios);
        root.insert_leaf(
            "design",
            Parameter::new(ParamType::scalar(ScalarKind::Str)),
        );
        root.insert_leaf(
            "sources",
            Parameter::new(ParamType::list(ScalarKind::File)),
        );

        let mut store = KeyStore::from_root(root);
        store.set(&["design"], "gcd");
        store.add(&["sources"], "gcd.v");
        store.set(&["mcmm", "worst", "corner"], "ss");
        store.set(&["mcmm", "worst", "voltage"], 0.9);
        store
    }

    #[test]
    fn prune_removes_templates_annotations_and_empty_leaves() {
        let store = populated_store();
        let pruned = prune(store.root(), false);
        // template gone
        assert!(pruned.node(&["mcmm", DEFAULT_KEY]).is_none());
        // set values survive
        assert!(pruned.node(&["mcmm", "worst", "corner"]).is_some());
        // unset leaf under the instantiated scenario... voltage was set, so present
        assert!(pruned.node(&["mcmm", "worst", "voltage"]).is_some());
        // help stripped
        let corner = pruned
            .node(&["mcmm", "worst", "corner"])
            .and_then(SchemaNode::as_leaf)
            .unwrap();
        assert!(corner.help.is_none());
    }

    #[test]
    fn prune_is_idempotent() {
        let store = populated_store();
        let once = prune(store.root(), false);
        let twice = prune(&once, false);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_after_prune_loses_no_set_values() {
        let store = populated_store();
        let pruned = prune(store.root(), false);
        let mut rebuilt = populated_store();
        merge(rebuilt.root_mut(), &pruned, MergeMode::Replace);

        assert_eq!(
            rebuilt.get(&["design"]),
            TypedValue::Str("gcd".to_string())
        );
        assert_eq!(
            rebuilt.get(&["mcmm", "worst", "corner"]),
            TypedValue::Str("ss".to_string())
        );
        assert_eq!(rebuilt.get(&["mcmm", "worst", "voltage"]), TypedValue::Num(0.9));
    }

    #[test]
    fn merge_append_extends_lists() {
        let mut base = populated_store();
        let mut overlay = populated_store();
        overlay.set(&["sources"], vec!["tb.v"]);
        merge(base.root_mut(), overlay.root(), MergeMode::Append);
        assert_eq!(
            base.get(&["sources"]).into_str_list(),
            vec!["gcd.v".to_string(), "tb.v".to_string()]
        );
    }

    #[test]
    fn merge_never_deletes_base_keys() {
        let mut base = populated_store();
        let overlay = Branch::new();
        merge(base.root_mut(), &overlay, MergeMode::Replace);
        assert_eq!(base.get(&["design"]), TypedValue::Str("gcd".to_string()));
    }
}
