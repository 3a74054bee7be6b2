use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub socket_path: PathBuf,
    pub state_dir: PathBuf,
    pub converge_interval_secs: u64,
    pub converge_timeout_secs: u64,
    pub adapter_timeout_secs: u64,
    pub detect_timeout_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub target_host: String,
    pub agent_api_url: String,
    pub forwarder_prefix: String,
    pub extension_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: "/run/guest-services/portferry.sock".into(),
            // Fallback for development; the extension mounts a volume here.
            state_dir: "/tmp".into(),
            converge_interval_secs: 5,
            converge_timeout_secs: 5,
            adapter_timeout_secs: 3,
            detect_timeout_ms: 500,
            shutdown_timeout_secs: 10,
            target_host: "localhost".into(),
            agent_api_url: "http://127.0.0.1:4040".into(),
            forwarder_prefix: "portferry".into(),
            extension_version: "unknown".into(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("portferry.toml"))
                .merge(Json::file("portferry.json"))
                .merge(Env::prefixed("PORTFERRY_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(url_file) = std::env::var("PORTFERRY_AGENT_API_URL_FILE") {
            config.agent_api_url = std::fs::read_to_string(url_file)?.trim().to_string();
        }

        if config.converge_interval_secs == 0 {
            anyhow::bail!("converge_interval_secs must be at least 1");
        }
        if config.forwarder_prefix.is_empty() {
            anyhow::bail!("forwarder_prefix must not be empty");
        }

        Ok(config)
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    pub fn converge_interval(&self) -> Duration {
        Duration::from_secs(self.converge_interval_secs)
    }

    pub fn converge_timeout(&self) -> Duration {
        Duration::from_secs(self.converge_timeout_secs)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_millis(self.detect_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::from_figment(defaults()).unwrap();
        assert_eq!(config.state_path(), PathBuf::from("/tmp/state.json"));
        assert_eq!(config.converge_interval(), Duration::from_secs(5));
        assert_eq!(config.detect_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn overrides_merge_over_defaults() {
        let figment = defaults().merge(Serialized::defaults(serde_json::json!({
            "state_dir": "/var/lib/portferry",
            "converge_interval_secs": 30,
        })));
        let config = Config::from_figment(figment).unwrap();
        assert_eq!(config.state_path(), PathBuf::from("/var/lib/portferry/state.json"));
        assert_eq!(config.converge_interval_secs, 30);
        assert_eq!(config.target_host, "localhost");
    }

    #[test]
    fn zero_interval_is_rejected() {
        let figment = defaults().merge(Serialized::defaults(serde_json::json!({
            "converge_interval_secs": 0,
        })));
        assert!(Config::from_figment(figment).is_err());
    }
}
