//! Tunnel service backed by a local tunnelling agent's REST API.
//!
//! Forwarders are agent tunnels named `<prefix>-<container id>`.  Only
//! tunnels carrying the prefix are ever listed or closed, so tunnels the
//! user started by hand are left alone.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{OpenRequest, TunnelService};
use crate::error::TunnelError;
use crate::types::{Forwarder, Protocol};

pub struct AgentTunnels {
    client: Client,
    base_url: String,
    prefix: String,
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<AgentTunnel>,
}

#[derive(Debug, Deserialize)]
struct AgentTunnel {
    name: String,
    public_url: String,
    proto: String,
    config: AgentTunnelConfig,
}

#[derive(Debug, Deserialize)]
struct AgentTunnelConfig {
    addr: String,
}

#[derive(Debug, Serialize)]
struct StartTunnel<'a> {
    name: &'a str,
    addr: String,
    proto: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pooling_enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct AgentError {
    #[serde(default)]
    msg: String,
}

impl AgentTunnels {
    pub fn new(
        base_url: impl Into<String>,
        prefix: impl Into<String>,
        version: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(format!("portferry/{}", version))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            prefix: prefix.into(),
        })
    }

    fn tunnel_name(&self, container_id: &str) -> String {
        format!("{}-{}", self.prefix, container_id)
    }

    fn container_of<'a>(&self, name: &'a str) -> Option<&'a str> {
        name.strip_prefix(self.prefix.as_str())?
            .strip_prefix('-')
            .filter(|id| !id.is_empty())
    }

    fn forwarder(&self, tunnel: AgentTunnel) -> Forwarder {
        let (protocol, target) = match tunnel.proto.as_str() {
            "tcp" => (Protocol::Tcp, tunnel.config.addr.clone()),
            "tls" => (Protocol::Tls, tunnel.config.addr.clone()),
            _ => match tunnel.config.addr.strip_prefix("https://") {
                Some(rest) => (Protocol::Https, rest.to_string()),
                None => (
                    Protocol::Http,
                    tunnel
                        .config
                        .addr
                        .trim_start_matches("http://")
                        .to_string(),
                ),
            },
        };
        Forwarder {
            container_id: self.container_of(&tunnel.name).map(str::to_string),
            id: tunnel.name,
            url: tunnel.public_url,
            target,
            protocol,
        }
    }
}

fn unavailable(e: reqwest::Error) -> TunnelError {
    TunnelError::ServiceUnavailable(e.to_string())
}

async fn error_for(response: reqwest::Response) -> TunnelError {
    let status = response.status();
    let body: AgentError = response.json().await.unwrap_or_default();
    let msg = if body.msg.is_empty() {
        status.to_string()
    } else {
        body.msg
    };

    match status {
        StatusCode::BAD_REQUEST if msg.to_lowercase().contains("limit") => {
            TunnelError::QuotaExceeded(msg)
        }
        StatusCode::BAD_REQUEST => TunnelError::InvalidTarget(msg),
        StatusCode::PAYMENT_REQUIRED | StatusCode::TOO_MANY_REQUESTS => {
            TunnelError::QuotaExceeded(msg)
        }
        _ => TunnelError::ServiceUnavailable(msg),
    }
}

#[async_trait]
impl TunnelService for AgentTunnels {
    async fn open(&self, request: &OpenRequest) -> Result<Forwarder, TunnelError> {
        let name = self.tunnel_name(&request.container_id);
        let (proto, addr) = match request.protocol {
            Protocol::Http => ("http", request.target.clone()),
            Protocol::Https => ("http", format!("https://{}", request.target)),
            Protocol::Tls => ("tls", request.target.clone()),
            Protocol::Tcp | Protocol::Unknown => ("tcp", request.target.clone()),
        };
        let body = StartTunnel {
            name: &name,
            addr,
            proto,
            description: request.options.description.as_deref(),
            metadata: request.options.metadata.as_deref(),
            pooling_enabled: request.options.pooling_enabled,
        };

        let response = self
            .client
            .post(format!("{}/api/tunnels", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        let tunnel: AgentTunnel = response.json().await.map_err(unavailable)?;
        let forwarder = self.forwarder(tunnel);
        info!("Agent opened {} -> {}", forwarder.id, forwarder.url);
        Ok(forwarder)
    }

    async fn close(&self, forwarder_id: &str) -> Result<(), TunnelError> {
        let response = self
            .client
            .delete(format!("{}/api/tunnels/{}", self.base_url, forwarder_id))
            .send()
            .await
            .map_err(unavailable)?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!("Forwarder {} already closed", forwarder_id);
                Ok(())
            }
            _ => Err(error_for(response).await),
        }
    }

    async fn list_open(&self) -> Result<Vec<Forwarder>, TunnelError> {
        let response = self
            .client
            .get(format!("{}/api/tunnels", self.base_url))
            .send()
            .await
            .map_err(unavailable)?;
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }
        let list: TunnelList = response.json().await.map_err(unavailable)?;

        Ok(list
            .tunnels
            .into_iter()
            .filter(|t| self.container_of(&t.name).is_some())
            .map(|t| self.forwarder(t))
            .collect())
    }
}
