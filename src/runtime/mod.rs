use crate::error::RuntimeError;
use crate::types::{ContainerEvent, ContainerSnapshot};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod docker;
pub use docker::DockerRuntime;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Snapshot every running container.
    async fn list_running(&self) -> Result<Vec<ContainerSnapshot>, RuntimeError>;

    /// Watch the runtime for container lifecycle changes, sending them to
    /// `event_tx` until the receiver is dropped.
    async fn monitor(&self, event_tx: mpsc::Sender<ContainerEvent>) -> anyhow::Result<()>;
}
