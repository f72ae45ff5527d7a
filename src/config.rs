use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine settings. Every field has a default so partial JSON files work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Domain appended to bare usernames and addressed by registration
    pub domain: String,
    /// WebSocket endpoint for the raw registration stream
    pub service: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// 0 disables keepalive pings
    pub keepalive_interval_ms: u64,
    pub registration_step_timeout_ms: u64,
    /// Ping period on the registration stream, 0 disables it
    pub registration_heartbeat_ms: u64,
    pub verify_timeout_ms: u64,
    pub verify_registration: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            domain: "localhost".to_string(),
            service: "ws://localhost:5280/xmpp-websocket".to_string(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            keepalive_interval_ms: 30_000,
            registration_step_timeout_ms: 5_000,
            registration_heartbeat_ms: 5_000,
            verify_timeout_ms: 2_000,
            verify_registration: true,
        }
    }
}

impl EngineConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn registration_step_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_step_timeout_ms)
    }

    pub fn registration_heartbeat(&self) -> Duration {
        Duration::from_millis(self.registration_heartbeat_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    /// Defaults overlaid with XMPP_* environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay XMPP_DOMAIN, XMPP_SERVICE and the timeout variables
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(domain) = lookup("XMPP_DOMAIN").filter(|v| !v.trim().is_empty()) {
            self.domain = domain.trim().to_string();
        }
        if let Some(service) = lookup("XMPP_SERVICE").filter(|v| !v.trim().is_empty()) {
            self.service = service.trim().to_string();
        }
        for (key, slot) in [
            ("XMPP_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms),
            ("XMPP_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms),
        ] {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse::<u64>() {
                    Ok(value) => *slot = value,
                    Err(_) => warn!("Ignoring non-numeric {}={}", key, raw),
                }
            }
        }
    }

    /// Read a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("parley").join("config.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.domain, "localhost");
        assert_eq!(config.service, "ws://localhost:5280/xmpp-websocket");
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.verify_timeout(), Duration::from_secs(2));
        assert_eq!(config.registration_heartbeat(), Duration::from_secs(5));
        assert!(config.verify_registration);
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("XMPP_DOMAIN", "chat.example.org"),
            ("XMPP_REQUEST_TIMEOUT_MS", "2500"),
            ("XMPP_CONNECT_TIMEOUT_MS", "soon"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config.apply_vars(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.domain, "chat.example.org");
        assert_eq!(config.service, "ws://localhost:5280/xmpp-websocket");
        assert_eq!(config.request_timeout_ms, 2500);
        assert_eq!(config.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_load_partial_file_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert_eq!(EngineConfig::load(&path).unwrap(), EngineConfig::default());

        fs::write(&path, r#"{"domain": "example.net", "verify_registration": false}"#).unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.domain, "example.net");
        assert!(!config.verify_registration);
        assert_eq!(config.keepalive_interval_ms, 30_000);
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = EngineConfig::default();
        config.service = "ws://10.0.0.5:5280/ws".to_string();
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }
}
