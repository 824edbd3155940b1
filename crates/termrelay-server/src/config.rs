//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use termrelay_core::{RelayError, RelayResult};
use tracing::info;

/// Smallest usable outbound queue: ack + replay + one live frame + close.
const MIN_SEND_QUEUE: usize = 4;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub history: HistorySection,
    #[serde(default)]
    pub ssh_profiles: Vec<SshProfile>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// `[relay]` section: session lifecycle and flow-control knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_grace_window")]
    pub grace_window_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_detached_buffer")]
    pub detached_buffer_bytes: usize,
    #[serde(default = "default_send_queue")]
    pub send_queue_frames: usize,
    #[serde(default = "default_backpressure_timeout")]
    pub backpressure_timeout_secs: u64,
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            grace_window_secs: default_grace_window(),
            idle_timeout_secs: default_idle_timeout(),
            detached_buffer_bytes: default_detached_buffer(),
            send_queue_frames: default_send_queue(),
            backpressure_timeout_secs: default_backpressure_timeout(),
            client_timeout_secs: default_client_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// `[shell]` section: what a `local-shell` session runs.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_shell")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: default_shell(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

/// `[tls]` section. Both paths must be set to serve `wss://`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsSection {
    pub cert: Option<String>,
    pub key: Option<String>,
}

/// `[auth]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded HMAC secret for bearer tokens.
    pub secret: Option<String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            secret: None,
            token_ttl_secs: default_token_ttl(),
        }
    }
}

/// `[history]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistorySection {
    pub dir: Option<String>,
}

/// `[[ssh_profiles]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct SshProfile {
    pub id: String,
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Owners allowed to use this profile. Empty means everyone.
    #[serde(default)]
    pub owners: Vec<String>,
}

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    8422
}
fn default_max_sessions() -> usize {
    100
}
fn default_grace_window() -> u64 {
    120
}
fn default_idle_timeout() -> u64 {
    1800
}
fn default_detached_buffer() -> usize {
    64 * 1024
}
fn default_send_queue() -> usize {
    64
}
fn default_backpressure_timeout() -> u64 {
    30
}
fn default_client_timeout() -> u64 {
    120
}
fn default_sweep_interval() -> u64 {
    5
}
fn default_token_ttl() -> u64 {
    86400
}
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Timing and buffer limits shared by the supervisor and relay engine.
#[derive(Debug, Clone)]
pub struct RelayLimits {
    pub max_sessions: usize,
    pub grace_window: Duration,
    pub idle_timeout: Duration,
    pub detached_buffer_bytes: usize,
    pub send_queue_frames: usize,
    pub backpressure_timeout: Duration,
    /// `None` disables the inbound heartbeat check.
    pub client_timeout: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self::from_section(&RelaySection::default(), default_max_sessions())
    }
}

impl RelayLimits {
    fn from_section(relay: &RelaySection, max_sessions: usize) -> Self {
        Self {
            max_sessions,
            grace_window: Duration::from_secs(relay.grace_window_secs),
            idle_timeout: Duration::from_secs(relay.idle_timeout_secs),
            detached_buffer_bytes: relay.detached_buffer_bytes,
            send_queue_frames: relay.send_queue_frames.max(MIN_SEND_QUEUE),
            backpressure_timeout: Duration::from_secs(relay.backpressure_timeout_secs),
            client_timeout: match relay.client_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            sweep_interval: Duration::from_secs(relay.sweep_interval_secs.max(1)),
        }
    }
}

/// CLI values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub max_sessions: Option<usize>,
    pub grace_window_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub shell: Option<String>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub limits: RelayLimits,
    pub shell: ShellConfig,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub auth_secret: Option<Vec<u8>>,
    pub token_ttl_secs: u64,
    pub history_dir: Option<PathBuf>,
    pub ssh_profiles: Vec<SshProfile>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Parse the TOML text of a config file.
    pub fn parse_file(content: &str) -> RelayResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| RelayError::Config(format!("config parse error: {e}")))
    }

    /// Merge a parsed file with CLI overrides.
    pub fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> RelayResult<Self> {
        let mut relay = file.relay;
        if let Some(secs) = overrides.grace_window_secs {
            relay.grace_window_secs = secs;
        }
        if let Some(secs) = overrides.idle_timeout_secs {
            relay.idle_timeout_secs = secs;
        }
        let max_sessions = overrides.max_sessions.unwrap_or(file.server.max_sessions);

        let mut shell = file.shell;
        if let Some(program) = overrides.shell {
            shell.program = program;
        }

        let tls_cert = overrides.cert.or(file.tls.cert);
        let tls_key = overrides.key.or(file.tls.key);
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(RelayError::Config(
                "tls requires both cert and key".into(),
            ));
        }

        let auth_secret = file
            .auth
            .secret
            .as_deref()
            .map(|s| {
                hex::decode(s.trim())
                    .map_err(|e| RelayError::Config(format!("auth.secret is not hex: {e}")))
            })
            .transpose()?;
        if matches!(&auth_secret, Some(s) if s.len() < 16) {
            return Err(RelayError::Config(
                "auth.secret must be at least 16 bytes".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for profile in &file.ssh_profiles {
            if !seen.insert(profile.id.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate ssh profile id: {}",
                    profile.id
                )));
            }
        }

        Ok(Self {
            bind: overrides.bind.unwrap_or(file.server.bind),
            port: overrides.port.unwrap_or(file.server.port),
            limits: RelayLimits::from_section(&relay, max_sessions),
            shell,
            tls_cert: tls_cert.as_deref().map(expand_tilde_str),
            tls_key: tls_key.as_deref().map(expand_tilde_str),
            auth_secret,
            token_ttl_secs: file.auth.token_ttl_secs,
            history_dir: file.history.dir.as_deref().map(expand_tilde_str),
            ssh_profiles: file.ssh_profiles,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

pub(crate) fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let file = ServerConfig::parse_file("").unwrap();
        let cfg = ServerConfig::resolve(file, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.port, 8422);
        assert_eq!(cfg.limits.grace_window, Duration::from_secs(120));
        assert_eq!(cfg.limits.detached_buffer_bytes, 65536);
        assert_eq!(cfg.limits.client_timeout, Some(Duration::from_secs(120)));
        assert!(cfg.tls_cert.is_none());
        assert!(cfg.ssh_profiles.is_empty());
    }

    #[test]
    fn file_values_and_overrides() {
        let toml = r#"
            [server]
            port = 9000
            max_sessions = 5

            [relay]
            grace_window_secs = 30
            client_timeout_secs = 0
            send_queue_frames = 1

            [shell]
            program = "/bin/zsh"
            args = ["-l"]

            [auth]
            secret = "00112233445566778899aabbccddeeff"

            [[ssh_profiles]]
            id = "prod"
            host = "prod.example.com"
            user = "deploy"
            owners = ["alice"]
        "#;
        let file = ServerConfig::parse_file(toml).unwrap();
        let cfg = ServerConfig::resolve(
            file,
            ConfigOverrides {
                port: Some(9100),
                idle_timeout_secs: Some(60),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.limits.max_sessions, 5);
        assert_eq!(cfg.limits.grace_window, Duration::from_secs(30));
        assert_eq!(cfg.limits.idle_timeout, Duration::from_secs(60));
        assert_eq!(cfg.limits.client_timeout, None);
        assert_eq!(cfg.limits.send_queue_frames, MIN_SEND_QUEUE);
        assert_eq!(cfg.shell.program, "/bin/zsh");
        assert_eq!(cfg.auth_secret.as_ref().map(Vec::len), Some(16));
        assert_eq!(cfg.ssh_profiles[0].owners, vec!["alice".to_string()]);
    }

    #[test]
    fn half_configured_tls_is_rejected() {
        let file = ServerConfig::parse_file("[tls]\ncert = \"/tmp/cert.pem\"\n").unwrap();
        assert!(ServerConfig::resolve(file, ConfigOverrides::default()).is_err());
    }

    #[test]
    fn duplicate_profiles_are_rejected() {
        let toml = r#"
            [[ssh_profiles]]
            id = "a"
            host = "one"
            [[ssh_profiles]]
            id = "a"
            host = "two"
        "#;
        let file = ServerConfig::parse_file(toml).unwrap();
        assert!(ServerConfig::resolve(file, ConfigOverrides::default()).is_err());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 7001\n").unwrap();
        let cfg = ServerConfig::load(Some(&path), ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.port, 7001);

        let missing = dir.path().join("absent.toml");
        let cfg = ServerConfig::load(Some(&missing), ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.port, 8422);
    }
}
