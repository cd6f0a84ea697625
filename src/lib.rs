//! # Fabflow: hardware compilation flow orchestration
//!
//! Fabflow drives a hardware compilation job from one self-describing
//! manifest: a nested keypath [`schema::KeyStore`] holds every setting,
//! the [`flowgraph`] read out of it declares what runs after what, and the
//! [`runtime::Pipeline`] fans the graph out over async tasks that spawn
//! tools, harvest metrics, and select among competing results.
//!
//! ## Core concepts
//!
//! - **KeyStore**: a schema tree of typed parameters addressed by keypath,
//!   with `default` templates that instantiate on first access
//! - **Flowgraph**: a DAG of `(step, index)` nodes, each bound to a tool
//!   adapter or a builtin selector (minimum, maximum, join, mux, verify)
//! - **Pipeline**: validates the whole configuration up front, runs every
//!   node in its own task over a private manifest copy, and merges the
//!   surviving results back
//!
//! ## Quick start
//!
//! ```no_run
//! use fabflow::runtime::Pipeline;
//! use fabflow::schema::default_schema;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut store = default_schema();
//! store.set(&["design"], "gcd");
//! store.set(&["flowgraph", "import", "0", "tool"], "surelog");
//! store.set(&["flowgraph", "syn", "0", "tool"], "yosys");
//! store.add(&["flowgraph", "syn", "0", "input", "import"], "0");
//!
//! let (store, summary) = Pipeline::new(store).run().await.map_err(|(_, e)| e)?;
//! println!("completed {} nodes in {}", summary.completed.len(), summary.job_dir.display());
//! # let _ = store;
//! # Ok(())
//! # }
//! ```
//!
//! Tool executables are wired in through [`runtime::ToolRegistry`]; without
//! a registered adapter a tool-bound node halts at runtime, which is what
//! the example above would do outside of documentation.

pub mod flowgraph;
pub mod runtime;
pub mod schema;
pub mod telemetry;

pub use flowgraph::{Flowgraph, NodeId};
pub use runtime::{Pipeline, RunSummary, ToolRegistry};
pub use schema::{KeyStore, default_schema};
