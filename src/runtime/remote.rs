//! Remote step dispatch.
//!
//! When `remote.addr` is set, tool-bound nodes ship their pruned manifest
//! to a dispatcher instead of spawning the executable locally; the response
//! manifest is merged back as if the node had run here. The transport is
//! behind a trait so deployments can plug in their own fabric without this
//! crate growing an HTTP client.

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::flowgraph::NodeId;
use crate::schema::Branch;

#[derive(Debug, Error, Diagnostic)]
pub enum RemoteError {
    #[error("remote.addr is set but no dispatcher is configured")]
    #[diagnostic(
        code(fabflow::remote::unconfigured),
        help("Attach a RemoteDispatch implementation to the pipeline, or unset remote.addr.")
    )]
    Unconfigured,

    #[error("remote dispatch to {addr} failed: {message}")]
    #[diagnostic(code(fabflow::remote::transport))]
    Transport { addr: String, message: String },

    #[error("remote run of {node} failed: {message}")]
    #[diagnostic(code(fabflow::remote::rejected))]
    Rejected { node: String, message: String },
}

/// One node's worth of work shipped to a dispatcher.
#[derive(Clone, Debug)]
pub struct RemoteRequest {
    pub node: NodeId,
    /// Pruned manifest snapshot for the remote side to rehydrate.
    pub manifest: Branch,
    pub addr: String,
    pub port: Option<u16>,
}

/// The dispatcher's answer: the manifest after the remote run, carrying
/// metrics, records, and result state to merge back.
#[derive(Clone, Debug)]
pub struct RemoteResponse {
    pub manifest: Branch,
}

#[async_trait]
pub trait RemoteDispatch: Send + Sync {
    async fn dispatch(&self, request: RemoteRequest) -> Result<RemoteResponse, RemoteError>;
}
