//! Schema violation taxonomy.
//!
//! Accessor and validation failures are *accumulated* rather than raised:
//! the [`KeyStore`](crate::schema::KeyStore) keeps a ledger of [`Violation`]s
//! so a whole setup pass can be validated in one batch before anything runs.
//! Lock hits are deliberately absent from the taxonomy — a locked parameter
//! silently ignores mutation, by contract.

use miette::Diagnostic;
use thiserror::Error;

/// A recorded schema-level violation.
///
/// Keypaths are rendered in their dotted form (`flowgraph.place.0.tool`).
#[derive(Debug, Clone, Error, Diagnostic, PartialEq)]
pub enum Violation {
    /// A value failed the declared parameter type check.
    #[error("type mismatch at [{keypath}]: {reason} (expected {expected})")]
    #[diagnostic(code(fabflow::schema::type_mismatch))]
    TypeMismatch {
        keypath: String,
        expected: String,
        reason: String,
    },

    /// A keypath does not exist and the enclosing branch has no template.
    #[error("keypath [{keypath}] does not exist")]
    #[diagnostic(
        code(fabflow::schema::missing_keypath),
        help("Check the keypath against the schema; dynamic names require a 'default' template.")
    )]
    MissingKeypath { keypath: String },

    /// `add` was called on a scalar parameter.
    #[error("illegal add() on scalar parameter [{keypath}]")]
    #[diagnostic(code(fabflow::schema::illegal_add))]
    IllegalAdd { keypath: String },

    /// A required parameter has no value.
    #[error("{requirement} requirement missing for [{keypath}]")]
    #[diagnostic(code(fabflow::schema::requirement_missing))]
    RequirementMissing {
        keypath: String,
        requirement: String,
    },

    /// A flowgraph input edge references an undeclared step.
    #[error("flowgraph input '{input}' of step '{step}' is not a declared step")]
    #[diagnostic(code(fabflow::flowgraph::bad_reference))]
    FlowgraphReference { step: String, input: String },

    /// The flowgraph contains a dependency cycle.
    #[error("flowgraph dependency cycle through step '{step}'")]
    #[diagnostic(code(fabflow::flowgraph::cycle))]
    FlowgraphCycle { step: String },

    /// A tool-bound flow node is missing a required tool keypath.
    #[error("tool '{tool}' at {step}{index}: empty required keypath [{keypath}]")]
    #[diagnostic(code(fabflow::check::tool_requirement))]
    ToolRequirementMissing {
        tool: String,
        step: String,
        index: String,
        keypath: String,
    },
}

/// Render a keypath slice into its dotted display form.
#[must_use]
pub fn keypath_display(keypath: &[&str]) -> String {
    keypath.join(".")
}
