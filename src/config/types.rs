use crate::policy::DeviceCapabilities;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub shares: Vec<ShareConfig>,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,

    #[serde(default)]
    pub device: DeviceCapabilities,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9032
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// A named directory root exposed to playback devices.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShareConfig {
    pub name: String,

    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamingConfig {
    /// Maximum number of concurrently active sessions. Requests beyond the
    /// cap are rejected immediately, never queued.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Seconds to wait for the external inspector before giving up on a probe.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Seconds to wait after SIGTERM before force-killing an encoder process.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,
}

fn default_max_sessions() -> usize {
    8
}
fn default_probe_timeout() -> u64 {
    10
}
fn default_cancel_grace() -> u64 {
    5
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            probe_timeout_secs: default_probe_timeout(),
            cancel_grace_secs: default_cancel_grace(),
        }
    }
}
