use crate::error::TunnelError;
use crate::types::{EndpointOptions, Forwarder, Protocol};
use async_trait::async_trait;

pub mod agent;
pub use agent::AgentTunnels;

/// What to open a forwarder for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub container_id: String,
    /// `host:port` the forwarder delivers traffic to.
    pub target: String,
    pub protocol: Protocol,
    pub options: EndpointOptions,
}

#[async_trait]
pub trait TunnelService: Send + Sync {
    async fn open(&self, request: &OpenRequest) -> Result<Forwarder, TunnelError>;

    /// Close a forwarder. Closing one that is already gone succeeds.
    async fn close(&self, forwarder_id: &str) -> Result<(), TunnelError>;

    /// Forwarders currently open on behalf of this process (or a previous
    /// incarnation of it).
    async fn list_open(&self) -> Result<Vec<Forwarder>, TunnelError>;
}
