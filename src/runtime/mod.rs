//! Job execution: workspace layout, tool adapters, per-node runners, and
//! the scheduler that ties a whole flowgraph run together.

pub mod events;
pub mod remote;
pub mod scheduler;
pub mod step_runner;
pub mod tooling;
pub mod workspace;

pub use events::{EventBus, RunEvent};
pub use remote::{RemoteDispatch, RemoteError, RemoteRequest, RemoteResponse};
pub use scheduler::{Pipeline, PipelineError, RunSummary};
pub use step_runner::{NodeOutcome, NodeSignal, RunContext, StepError, run_step};
pub use tooling::{ToolAdapter, ToolError, ToolRegistry};
pub use workspace::{JobDirs, WorkspaceError, copy_dir_contents, write_replay_script};
