use super::ContainerRuntime;
use crate::error::RuntimeError;
use crate::types::{ContainerEvent, ContainerSnapshot, PublishedPort};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerSummary, PortTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and make sure it answers.
    pub async fn connect() -> Result<Self> {
        // Handles the unix socket on Linux and DOCKER_HOST overrides.
        let docker = Docker::connect_with_local_defaults()?;
        docker
            .ping()
            .await
            .map_err(|e| anyhow!("Docker daemon is not reachable: {}", e))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(opts))
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        Ok(containers.into_iter().filter_map(snapshot).collect())
    }

    async fn monitor(&self, event_tx: mpsc::Sender<ContainerEvent>) -> Result<()> {
        loop {
            let opts = EventsOptions::<String> {
                filters: [
                    ("type", ["container"].as_slice()),
                    ("event", ["start", "die", "kill", "stop"].as_slice()),
                ]
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
                ..Default::default()
            };

            let mut stream = self.docker.events(Some(opts));

            info!("Listening for Docker events...");
            while let Some(msg) = stream.next().await {
                let event = match msg {
                    Ok(event) => event,
                    Err(e) => {
                        error!("Error in Docker event stream: {}", e);
                        break; // Break inner loop to reconnect
                    }
                };
                let Some(id) = event.actor.and_then(|a| a.id) else {
                    continue;
                };

                let action = event.action.unwrap_or_default();
                debug!("Container event: {} for {}", action, id);

                let update = match action.as_str() {
                    "start" => ContainerEvent::Started { id },
                    "die" | "kill" | "stop" => ContainerEvent::Stopped { id },
                    _ => continue,
                };
                if event_tx.send(update).await.is_err() {
                    info!("Event receiver dropped, stopping Docker monitor");
                    return Ok(());
                }
            }

            warn!("Docker event stream ended. Reconnecting in 2s...");
            sleep(Duration::from_secs(2)).await;
        }
    }
}

fn snapshot(c: ContainerSummary) -> Option<ContainerSnapshot> {
    let id = c.id?;
    let name = c
        .names
        .as_ref()
        .and_then(|n| n.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.clone());

    let published_ports = c
        .ports
        .unwrap_or_default()
        .into_iter()
        .filter(|p| matches!(p.typ, None | Some(PortTypeEnum::TCP)))
        .map(|p| PublishedPort {
            private_port: p.private_port,
            public_port: p.public_port,
        })
        .collect();

    Some(ContainerSnapshot {
        id,
        name,
        published_ports,
        labels: c.labels.unwrap_or_default(),
    })
}
