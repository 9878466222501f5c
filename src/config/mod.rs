//! Client configuration

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::calling::engine::{CaptureSettings, IceServer, MediaConstraints};
use crate::calling::NegotiationConfig;
use crate::client::ClientConfig;
use crate::janus::envelope::VIDEOCALL_PLUGIN;
use crate::janus::session::SessionConfig;

/// The gateway reaps sessions that stay silent this long.
const GATEWAY_SESSION_TIMEOUT_SEC: u64 = 60;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Gateway WebSocket endpoint (`ws://` or `wss://`)
    pub server_uri: String,
    pub connect_timeout_ms: u64,
    /// Silence after which the transport sends a ping, then gives up
    pub idle_interval_sec: u64,
    pub keepalive_interval_sec: u64,
    pub transaction_timeout_ms: u64,
    pub ice_servers: Vec<IceServer>,
    pub enable_h264_high_profile: bool,
    pub prefer_front_camera: bool,
    pub video_width: u32,
    pub video_height: u32,
    pub video_fps: u32,
    /// Name to register with when none is given on the command line
    pub username: Option<String>,
    /// Answer incoming calls without asking
    pub auto_accept: bool,
    pub plugin: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_uri: "ws://localhost:8188/".to_string(),
            connect_timeout_ms: 40_000,
            idle_interval_sec: 20,
            keepalive_interval_sec: 25,
            transaction_timeout_ms: 10_000,
            ice_servers: IceServer::default_servers(),
            enable_h264_high_profile: true,
            prefer_front_camera: true,
            video_width: 640,
            video_height: 480,
            video_fps: 30,
            username: None,
            auto_accept: false,
            plugin: VIDEOCALL_PLUGIN.to_string(),
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "janus-videocall", "janus-videocall")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from `path`, falling back to defaults if it is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        // May hold TURN credentials
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let uri = Url::parse(&self.server_uri)
            .with_context(|| format!("Invalid server_uri '{}'", self.server_uri))?;
        if uri.scheme() != "ws" && uri.scheme() != "wss" {
            bail!(
                "server_uri must be a ws:// or wss:// URL, got '{}'",
                self.server_uri
            );
        }

        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("idle_interval_sec", self.idle_interval_sec),
            ("keepalive_interval_sec", self.keepalive_interval_sec),
            ("transaction_timeout_ms", self.transaction_timeout_ms),
        ] {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.keepalive_interval_sec >= GATEWAY_SESSION_TIMEOUT_SEC {
            bail!(
                "keepalive_interval_sec must be below {} (the gateway session timeout)",
                GATEWAY_SESSION_TIMEOUT_SEC
            );
        }

        for server in &self.ice_servers {
            for url in &server.urls {
                if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:")) {
                    bail!("Unsupported ICE server URL '{}'", url);
                }
            }
        }
        if self.plugin.is_empty() {
            bail!("plugin must not be empty");
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_sec)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            keepalive_interval: Duration::from_secs(self.keepalive_interval_sec),
            session: SessionConfig {
                plugin: self.plugin.clone(),
                transaction_timeout: Duration::from_millis(self.transaction_timeout_ms),
            },
            negotiation: NegotiationConfig {
                ice_servers: self.ice_servers.clone(),
                capture: CaptureSettings {
                    width: self.video_width,
                    height: self.video_height,
                    fps: self.video_fps,
                    prefer_front_camera: self.prefer_front_camera,
                },
                constraints: MediaConstraints::default(),
            },
        }
    }
}
