//! The configuration (schema) engine.
//!
//! A dynamically typed, self-describing nested key-path store with
//! default-template instantiation, type coercion, locking, tree merge/prune,
//! and multi-format manifest persistence. Every other subsystem reads and
//! writes configuration exclusively through [`KeyStore`]'s accessor.

pub mod defaults;
pub mod errors;
pub mod manifest;
pub mod merge;
pub mod param;
pub mod store;

pub use defaults::{METRICS, default_schema};
pub use errors::Violation;
pub use manifest::{ManifestError, WriteOptions, read_manifest, snapshot_all_formats, write_manifest};
pub use merge::{MergeMode, merge, prune};
pub use param::{ParamType, Parameter, RawValue, ScalarKind, TypedValue};
pub use store::{Branch, DEFAULT_KEY, KeyStore, SchemaNode};
