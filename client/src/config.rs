//! Configuration for Hookline
//!
//! Reads `config.yml` (API token, base URL, reconnect tuning) and turns the
//! resolved values into an explicit [`SessionIdentity`] that is threaded
//! through the session and forwarder.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use hookline_shared::protocol::TUNNEL_PATH;
use hookline_shared::Error;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::supervisor::ReconnectPolicy;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooklineConfig {
    /// Bearer token presented in the tunnel handshake
    pub api_token: Option<String>,

    /// Base URL of the relay / API service
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Base URL used in capture acknowledgements (defaults to `api_url`)
    pub viewer_url: Option<String>,

    /// Path segment of the capture sink (`/<sink_path>/<bin>/...`)
    #[serde(default = "default_sink_path")]
    pub sink_path: String,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Timeout for each local forwarding call
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_secs: u64,

    /// Time allowed between opening the transport and the relay's reply
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
        }
    }
}

impl Default for HooklineConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            api_url: default_api_url(),
            viewer_url: None,
            sink_path: default_sink_path(),
            reconnect: ReconnectConfig::default(),
            forward_timeout_secs: default_forward_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

fn default_api_url() -> String {
    "http://localhost:3002".to_string()
}

fn default_sink_path() -> String {
    "b".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    2
}

fn default_forward_timeout() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
    10
}

impl HooklineConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: HooklineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load the explicit path if given, else the default location if it
    /// exists, else built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/hookline/config.yml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hookline").join("config.yml"))
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        parse_endpoint(&self.api_url)?;
        if let Some(viewer) = &self.viewer_url {
            Url::parse(viewer).with_context(|| format!("Invalid viewer_url '{}'", viewer))?;
        }
        if self.sink_path.trim_matches('/').is_empty() {
            anyhow::bail!("sink_path cannot be empty");
        }
        if self.forward_timeout_secs == 0 || self.handshake_timeout_secs == 0 {
            anyhow::bail!("timeouts must be at least one second");
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect.max_attempts,
            base_delay: Duration::from_secs(self.reconnect.base_delay_secs),
        }
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn viewer_base(&self) -> &str {
        self.viewer_url.as_deref().unwrap_or(&self.api_url)
    }
}

/// Who this session is and where it connects. Immutable once built.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    tunnel_id: String,
    local_port: u16,
    auth_token: String,
    endpoint: Url,
    tunnel_url: Url,
}

impl SessionIdentity {
    pub fn new(
        tunnel_id: impl Into<String>,
        local_port: u16,
        auth_token: impl Into<String>,
        endpoint: &str,
    ) -> hookline_shared::Result<Self> {
        if local_port == 0 {
            return Err(Error::InvalidPort(local_port.to_string()));
        }
        let auth_token = auth_token.into();
        if auth_token.trim().is_empty() {
            return Err(Error::MissingToken);
        }
        let endpoint = parse_endpoint(endpoint)?;
        let tunnel_url = tunnel_url(&endpoint)?;

        Ok(Self {
            tunnel_id: tunnel_id.into(),
            local_port,
            auth_token,
            endpoint,
            tunnel_url,
        })
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Duplex endpoint: `<endpoint>/ws/tunnel` with the scheme mapped to ws/wss.
    pub fn tunnel_url(&self) -> &Url {
        &self.tunnel_url
    }

    /// True when tunnel traffic would cross a network unencrypted.
    pub fn is_plaintext_remote(&self) -> bool {
        self.tunnel_url.scheme() == "ws" && !is_loopback_host(&self.tunnel_url)
    }
}

/// Parse a port argument, rejecting anything outside 1-65535.
pub fn parse_port(s: &str) -> hookline_shared::Result<u16> {
    match s.trim().parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Ok(port as u16),
        _ => Err(Error::InvalidPort(s.to_string())),
    }
}

fn parse_endpoint(raw: &str) -> hookline_shared::Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::InvalidEndpoint(raw.to_string(), e.to_string()))?;
    match url.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(url),
        other => Err(Error::InvalidEndpoint(
            raw.to_string(),
            format!("unsupported scheme '{}'", other),
        )),
    }
}

fn tunnel_url(endpoint: &Url) -> hookline_shared::Result<Url> {
    let mut url = endpoint.clone();
    let scheme = match endpoint.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme).map_err(|_| {
        Error::InvalidEndpoint(endpoint.to_string(), format!("cannot use scheme '{}'", scheme))
    })?;

    let path = format!("{}{}", endpoint.path().trim_end_matches('/'), TUNNEL_PATH);
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn is_loopback_host(url: &Url) -> bool {
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false),
        None => false,
    }
}
