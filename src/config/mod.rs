//! # Configuration
//!
//! JSON configuration for the meshdesk runtime (spec.md §6): connection
//! settings, logging, and UI-owned state (last selected chat, map viewport,
//! autostart, notification policy). Unknown fields are ignored on load;
//! missing fields default — every section derives `Default` and is decoded
//! with `#[serde(default)]` on its container field.
//!
//! Persisted atomically: write to a sibling temp file, then rename over the
//! target (spec.md §4.10 `SaveAndApplyConfig`, §5 "Persisted config").

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorKind {
    Ip,
    Serial,
    Bluetooth,
}

impl Default for ConnectorKind {
    fn default() -> Self {
        ConnectorKind::Serial
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub connector: ConnectorKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub serial_port: Option<String>,
    #[serde(default)]
    pub serial_baud: Option<u32>,
    #[serde(default)]
    pub bluetooth_address: Option<String>,
    #[serde(default)]
    pub bluetooth_adapter: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub log_to_file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_to_file: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MapViewportConfig {
    #[serde(default)]
    pub set: bool,
    #[serde(default)]
    pub zoom: f64,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AutostartMode {
    Hidden,
    Normal,
}

impl Default for AutostartMode {
    fn default() -> Self {
        AutostartMode::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AutostartConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: AutostartMode,
}

/// Which bus-sourced events the notification service considers (spec.md §2
/// item 7 / SPEC_FULL notification policy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEventsConfig {
    #[serde(default = "default_true")]
    pub incoming_message: bool,
    #[serde(default = "default_true")]
    pub node_discovered: bool,
    #[serde(default = "default_true")]
    pub connection_status: bool,
    #[serde(default = "default_true")]
    pub update_available: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NotificationEventsConfig {
    fn default() -> Self {
        Self {
            incoming_message: true,
            node_discovered: true,
            connection_status: true,
            update_available: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub notify_when_focused: bool,
    #[serde(default)]
    pub events: NotificationEventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UiConfig {
    #[serde(default)]
    pub last_selected_chat: Option<String>,
    #[serde(default)]
    pub map_viewport: MapViewportConfig,
    #[serde(default)]
    pub autostart: AutostartConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub ui: UiConfig,
}

impl Config {
    /// Load and parse the JSON config at `path`. Missing/unknown fields are
    /// tolerated per spec.md §6.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Load if present, else the default configuration.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Validate connector-specific fields (SPEC_FULL-2: config validation
    /// beyond spec.md's one-liner).
    pub fn validate(&self) -> Result<()> {
        match self.connection.connector {
            ConnectorKind::Ip => {
                if self.connection.host.as_deref().unwrap_or("").trim().is_empty() {
                    return Err(anyhow!(
                        "connection.host must not be empty for the ip connector. SOLUTION: set connection.host to the radio's IP or hostname"
                    ));
                }
            }
            ConnectorKind::Serial => {
                if let Some(baud) = self.connection.serial_baud {
                    if !(300..=4_000_000).contains(&baud) {
                        return Err(anyhow!(
                            "connection.serial_baud {} is out of range. SOLUTION: use a standard baud rate such as 115200",
                            baud
                        ));
                    }
                }
            }
            ConnectorKind::Bluetooth => {
                let addr = self.connection.bluetooth_address.as_deref().unwrap_or("");
                if addr.trim().is_empty() {
                    return Err(anyhow!(
                        "connection.bluetooth_address must not be empty for the bluetooth connector. SOLUTION: pair the radio first and copy its MAC address"
                    ));
                }
            }
        }
        Ok(())
    }

    /// Atomic write: temp file in the same directory, then rename over the
    /// target (spec.md §4.10, §5 "Persisted config").
    pub async fn save_atomic(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("serializing config")?;
        let tmp_path = tmp_path_for(path);
        fs::write(&tmp_path, content)
            .await
            .with_context(|| format!("writing temp config file {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp_path.display(), path.display()))?;
        Ok(())
    }

    /// `SaveAndApplyConfig` field-preservation step (spec.md §4.10):
    /// UI-only fields (selected chat, map viewport) survive a save that only
    /// touches connection/logging.
    pub fn preserve_ui_only_fields(&mut self, previous: &Config) {
        self.ui.last_selected_chat = previous.ui.last_selected_chat.clone();
        self.ui.map_viewport = previous.ui.map_viewport.clone();
    }

    pub fn create_default(path: &Path) -> Config {
        let _ = path;
        Config::default()
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn round_trips_through_atomic_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.connection.connector = ConnectorKind::Ip;
        config.connection.host = Some("10.0.0.5".into());
        config.save_atomic(&path).await.unwrap();

        let loaded = Config::load(&path).await.unwrap();
        assert_eq!(loaded.connection.connector, ConnectorKind::Ip);
        assert_eq!(loaded.connection.host.as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn unknown_and_missing_fields_are_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"connection":{"connector":"serial"},"future_field":123}"#)
            .await
            .unwrap();
        let loaded = Config::load(&path).await.unwrap();
        assert_eq!(loaded.connection.connector, ConnectorKind::Serial);
        assert_eq!(loaded.logging.level, "info");
    }

    #[test]
    fn ip_connector_requires_host() {
        let mut config = Config::default();
        config.connection.connector = ConnectorKind::Ip;
        assert!(config.validate().is_err());
        config.connection.host = Some("radio.local".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn save_preserves_ui_only_fields() {
        let mut previous = Config::default();
        previous.ui.last_selected_chat = Some("channel:0".into());
        previous.ui.map_viewport.zoom = 12.0;

        let mut incoming = Config::default();
        incoming.connection.connector = ConnectorKind::Ip;
        incoming.preserve_ui_only_fields(&previous);

        assert_eq!(incoming.ui.last_selected_chat.as_deref(), Some("channel:0"));
        assert_eq!(incoming.ui.map_viewport.zoom, 12.0);
    }
}
