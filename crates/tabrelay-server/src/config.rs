//! Server configuration: TOML file + CLI overrides.

use crate::auth::RateLimitSettings;
use crate::relay::HubSettings;
use crate::upstream::websocket::RemoteEndpoints;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabrelay_core::{RelayError, RelayResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub upstream: UpstreamSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds without activity before a session expires.
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Capability identifiers advertised in session info.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Seconds a start request waits before answering "still starting".
    #[serde(default = "default_start_wait")]
    pub start_wait: u64,
    /// Rejected passwords per client address and session, per minute.
    #[serde(default = "default_credential_failures")]
    pub credential_failures_per_minute: usize,
    /// WebSocket attaches per client address, per minute.
    #[serde(default = "default_attaches")]
    pub attaches_per_minute: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            session_ttl: default_session_ttl(),
            max_sessions: default_max_sessions(),
            capabilities: Vec::new(),
            start_wait: default_start_wait(),
            credential_failures_per_minute: default_credential_failures(),
            attaches_per_minute: default_attaches(),
        }
    }
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
    #[serde(default = "default_idle_grace")]
    pub idle_grace: u64,
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
    #[serde(default = "default_attach_timeout")]
    pub attach_timeout: u64,
    #[serde(default = "default_wake_timeout")]
    pub wake_timeout: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            replay_capacity: default_replay_capacity(),
            idle_grace: default_idle_grace(),
            client_buffer: default_client_buffer(),
            attach_timeout: default_attach_timeout(),
            wake_timeout: default_wake_timeout(),
        }
    }
}

/// Where terminal resources live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    /// Local processes in pseudo-terminals.
    #[default]
    Pty,
    /// Remote resources behind a WebSocket URL.
    Websocket,
}

/// `[upstream]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    #[serde(default)]
    pub mode: UpstreamMode,
    /// Command run in each PTY; the user's shell when unset.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_upstream_port")]
    pub port: u16,
    #[serde(default)]
    pub start_url: Option<String>,
    #[serde(default)]
    pub wake_url: Option<String>,
    #[serde(default)]
    pub ready_url: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            mode: UpstreamMode::default(),
            command: None,
            url: default_upstream_url(),
            port: default_upstream_port(),
            start_url: None,
            wake_url: None,
            ready_url: None,
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
fn default_port() -> u16 {
    8787
}
fn default_session_ttl() -> u64 {
    86400
}
fn default_max_sessions() -> usize {
    1000
}
fn default_start_wait() -> u64 {
    120
}
fn default_credential_failures() -> usize {
    RateLimitSettings::default().credential_failures
}
fn default_attaches() -> usize {
    RateLimitSettings::default().attaches
}
fn default_replay_capacity() -> usize {
    crate::relay::replay::DEFAULT_REPLAY_CAPACITY
}
fn default_idle_grace() -> u64 {
    30
}
fn default_client_buffer() -> usize {
    256
}
fn default_attach_timeout() -> u64 {
    90
}
fn default_wake_timeout() -> u64 {
    60
}
fn default_upstream_url() -> String {
    "ws://127.0.0.1:{port}/{resource}/ws".to_string()
}
fn default_upstream_port() -> u16 {
    7681
}
fn default_connect_timeout() -> u64 {
    10
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub max_sessions: Option<usize>,
    pub session_ttl: Option<u64>,
    pub idle_grace: Option<u64>,
    pub upstream_mode: Option<UpstreamMode>,
    pub command: Option<String>,
    pub upstream_url: Option<String>,
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub max_sessions: usize,
    pub session_ttl: Duration,
    pub capabilities: Vec<String>,
    pub start_wait: Duration,
    pub limits: RateLimitSettings,
    pub hub: HubSettings,
    pub upstream: UpstreamSection,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file means defaults.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    /// Merge CLI overrides into a parsed file.
    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> RelayResult<Self> {
        let ConfigFile {
            server,
            relay,
            mut upstream,
        } = file;

        if let Some(mode) = cli.upstream_mode {
            upstream.mode = mode;
        }
        if cli.command.is_some() {
            upstream.command = cli.command;
        }
        if let Some(url) = cli.upstream_url {
            upstream.url = url;
        }

        if relay.client_buffer == 0 {
            return Err(RelayError::Config("relay.client_buffer must be at least 1".into()));
        }
        if upstream.mode == UpstreamMode::Websocket && !upstream.url.contains("{resource}") {
            return Err(RelayError::Config(
                "upstream.url must contain a {resource} placeholder".into(),
            ));
        }

        let bind = cli.bind.unwrap_or(server.bind);
        let port = cli.port.unwrap_or(server.port);

        Ok(Self {
            listen: SocketAddr::new(bind, port),
            max_sessions: cli.max_sessions.unwrap_or(server.max_sessions),
            session_ttl: Duration::from_secs(cli.session_ttl.unwrap_or(server.session_ttl)),
            capabilities: server.capabilities,
            start_wait: Duration::from_secs(server.start_wait),
            limits: RateLimitSettings {
                credential_failures: server.credential_failures_per_minute,
                attaches: server.attaches_per_minute,
                window: Duration::from_secs(60),
            },
            hub: HubSettings {
                replay_capacity: relay.replay_capacity,
                client_buffer: relay.client_buffer,
                idle_grace: Duration::from_secs(cli.idle_grace.unwrap_or(relay.idle_grace)),
                attach_timeout: Duration::from_secs(relay.attach_timeout),
                wake_timeout: Duration::from_secs(relay.wake_timeout),
            },
            upstream,
        })
    }

    /// Endpoint templates for the WebSocket upstream mode.
    pub fn remote_endpoints(&self) -> RemoteEndpoints {
        RemoteEndpoints {
            url: self.upstream.url.clone(),
            port: self.upstream.port,
            start_url: self.upstream.start_url.clone(),
            wake_url: self.upstream.wake_url.clone(),
            ready_url: self.upstream.ready_url.clone(),
            connect_timeout: Duration::from_secs(self.upstream.connect_timeout),
        }
    }
}

fn parse(content: &str) -> RelayResult<ConfigFile> {
    toml::from_str(content).map_err(|e| RelayError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let cfg = ServerConfig::load(None, CliOverrides::default()).unwrap();
        assert_eq!(cfg.listen.port(), 8787);
        assert_eq!(cfg.hub.replay_capacity, 1000);
        assert_eq!(cfg.hub.idle_grace, Duration::from_secs(30));
        assert_eq!(cfg.session_ttl, Duration::from_secs(86400));
        assert_eq!(cfg.upstream.mode, UpstreamMode::Pty);
        assert_eq!(cfg.upstream.port, 7681);
        assert_eq!(cfg.limits, RateLimitSettings::default());
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9000
capabilities = ["claude", "codex"]
attaches_per_minute = 10

[relay]
idle_grace = 5
replay_capacity = 50

[upstream]
mode = "websocket"
url = "wss://{{resource}}.example.net:{{port}}/ws"
wake_url = "https://api.example.net/resources/{{resource}}/wake"
"#
        )
        .unwrap();

        let cli = CliOverrides {
            port: Some(9100),
            ..Default::default()
        };
        let cfg = ServerConfig::load(Some(file.path()), cli).unwrap();
        assert_eq!(cfg.listen.port(), 9100);
        assert_eq!(cfg.capabilities, vec!["claude", "codex"]);
        assert_eq!(cfg.limits.attaches, 10);
        assert_eq!(cfg.limits.credential_failures, 5);
        assert_eq!(cfg.hub.idle_grace, Duration::from_secs(5));
        assert_eq!(cfg.hub.replay_capacity, 50);
        assert_eq!(cfg.upstream.mode, UpstreamMode::Websocket);
        assert_eq!(
            cfg.remote_endpoints().wake_url.as_deref(),
            Some("https://api.example.net/resources/{resource}/wake")
        );
    }

    #[test]
    fn missing_file_means_defaults() {
        let cfg = ServerConfig::load(
            Some(Path::new("/nonexistent/tabrelay.toml")),
            CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.listen.port(), 8787);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(parse("[server]\nport = \"x\""), Err(RelayError::Config(_))));

        let mut file = ConfigFile::default();
        file.relay.client_buffer = 0;
        assert!(ServerConfig::resolve(file, CliOverrides::default()).is_err());

        let mut file = ConfigFile::default();
        file.upstream.mode = UpstreamMode::Websocket;
        file.upstream.url = "ws://fixed/ws".into();
        assert!(ServerConfig::resolve(file, CliOverrides::default()).is_err());
    }

    #[test]
    fn tilde_expansion() {
        let plain = expand_tilde(Path::new("/etc/tabrelay.toml"));
        assert_eq!(plain, PathBuf::from("/etc/tabrelay.toml"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/x.toml")), home.join("x.toml"));
        }
    }
}
