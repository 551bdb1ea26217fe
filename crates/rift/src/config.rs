use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{
    net,
    tunnel::{
        dial::ProxySource,
        secure::{AuthMethod, Console, HostKey},
        session::{LifecycleSignal, SessionConfig, Timeouts},
    },
};

const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os("RIFT_CONFIG").filter(|p| !p.is_empty()) {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(Path::new(&p))?,
            source: ConfigPathSource::Env,
        });
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    match fs::metadata(p) {
        Ok(m) if m.is_dir() => Ok(discover_config_path(p).unwrap_or_else(|| p.join("rift.toml"))),
        Ok(_) => Ok(p.to_path_buf()),
        Err(_) => {
            let mut out = p.to_path_buf();
            if out.extension().is_none() {
                out.set_extension("toml");
            }
            Ok(out)
        }
    }
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["rift.toml", "rift.yaml", "rift.yml"]
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).is_ok_and(|m| m.is_file()))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/rift/rift.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("dev", "rift", "rift").context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("rift.toml"))
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {:?} (expected .toml or .yaml/.yml)", ext),
    };

    Config::from_file_config(fc, path)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub relay: RelayConfig,
    pub remote: Endpoint,
    pub target: Endpoint,
    pub timeouts: Timeouts,
    pub reconnect: ReconnectConfig,
    pub logging: LoggingConfig,
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Always `host:port`.
    pub addr: String,
    pub user: String,
    pub auth: AuthMethod,
    pub host_key: HostKey,
    pub hide_banner: bool,
    pub control_command: Option<String>,
    pub proxy: ProxySource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Config {
    /// Parameters for one session attempt. Hooks are a library-level extension
    /// and never come from the file.
    pub fn session_config(
        &self,
        console: Arc<dyn Console>,
        events: Option<mpsc::UnboundedSender<LifecycleSignal>>,
    ) -> SessionConfig {
        SessionConfig {
            relay_addr: self.relay.addr.clone(),
            proxy: self.relay.proxy.clone(),
            user: self.relay.user.clone(),
            auth: self.relay.auth.clone(),
            host_key: self.relay.host_key.clone(),
            remote_host: self.remote.host.clone(),
            remote_port: self.remote.port,
            target_host: self.target.host.clone(),
            target_port: self.target.port,
            hook: None,
            hide_banner: self.relay.hide_banner,
            control_command: self.relay.control_command.clone(),
            console,
            timeouts: self.timeouts.clone(),
            events,
        }
    }

    fn from_file_config(fc: FileConfig, config_path: &Path) -> anyhow::Result<Config> {
        let relay = fc.relay.context("config: missing [relay] section")?;
        let remote = fc.remote.context("config: missing [remote] section")?;
        let target = fc.target.context("config: missing [target] section")?;

        let addr = required(relay.addr, "relay.addr")?;
        let addr = if net::has_port(&addr) {
            addr
        } else {
            net::join_host_port(&addr, DEFAULT_SSH_PORT)
        };
        let user = required(relay.user, "relay.user")?;
        let host_key = HostKey::parse(&required(relay.host_key, "relay.host_key")?)
            .map_err(|e| anyhow::anyhow!("config: relay.host_key: {e}"))?;

        let auth = match (relay.password, non_empty(relay.key_file)) {
            (Some(_), Some(_)) => {
                anyhow::bail!("config: relay.password and relay.key_file are mutually exclusive")
            }
            (Some(password), None) => AuthMethod::Password(password),
            (None, Some(key_file)) => AuthMethod::PublicKey {
                key_file: relative_to_config(config_path, &key_file),
                passphrase: relay.key_passphrase,
            },
            (None, None) => AuthMethod::None,
        };

        let proxy = match relay.proxy.as_deref().map(str::trim) {
            None | Some("") | Some("env") => ProxySource::Environment,
            Some("none") => ProxySource::Disabled,
            Some(url) => ProxySource::Url(url.to_string()),
        };

        let remote = Endpoint {
            host: non_empty(remote.host).unwrap_or_else(|| "0.0.0.0".into()),
            port: remote.port.context("config: remote.port is required")?,
        };
        let target = Endpoint {
            host: non_empty(target.host).unwrap_or_else(|| "127.0.0.1".into()),
            port: match target.port {
                Some(0) | None => anyhow::bail!("config: target.port is required"),
                Some(p) => p,
            },
        };

        let t = fc.timeouts.unwrap_or_default();
        let timeouts = Timeouts {
            connect: millis(t.connect_timeout_ms, 10_000),
            handshake: millis(t.handshake_timeout_ms, 15_000),
            target_dial: millis(t.target_dial_timeout_ms, 5_000),
        };

        let r = fc.reconnect.unwrap_or_default();
        let reconnect = ReconnectConfig {
            initial_backoff: millis(r.initial_backoff_ms, 1_000).max(Duration::from_millis(1)),
            max_backoff: millis(r.max_backoff_ms, 10_000),
        };
        if reconnect.max_backoff < reconnect.initial_backoff {
            anyhow::bail!("config: reconnect.max_backoff_ms must be >= initial_backoff_ms");
        }

        let lg = fc.logging.unwrap_or_default();
        let logging = LoggingConfig {
            level: non_empty(lg.level).unwrap_or_else(|| "info".into()),
            format: non_empty(lg.format).unwrap_or_else(|| "json".into()),
            output: non_empty(lg.output).unwrap_or_else(|| "stderr".into()),
            add_source: lg.add_source,
        };

        let metrics_addr = match non_empty(fc.metrics_addr) {
            None => None,
            Some(a) => Some(
                net::normalize_bind_addr(&a)
                    .parse::<SocketAddr>()
                    .with_context(|| format!("config: invalid metrics_addr {a:?}"))?,
            ),
        };

        Ok(Config {
            relay: RelayConfig {
                addr,
                user,
                auth,
                host_key,
                hide_banner: relay.hide_banner,
                control_command: non_empty(relay.control_command),
                proxy,
            },
            remote,
            target,
            timeouts,
            reconnect,
            logging,
            metrics_addr,
        })
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn required(v: Option<String>, name: &str) -> anyhow::Result<String> {
    non_empty(v).with_context(|| format!("config: {name} is required"))
}

fn millis(v: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(v.unwrap_or(default))
}

fn relative_to_config(config_path: &Path, p: &str) -> PathBuf {
    let p = PathBuf::from(p);
    match config_path.parent() {
        Some(dir) if p.is_relative() && !dir.as_os_str().is_empty() => dir.join(p),
        _ => p,
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    relay: Option<FileRelay>,
    remote: Option<FileEndpoint>,
    target: Option<FileEndpoint>,
    timeouts: Option<FileTimeouts>,
    reconnect: Option<FileReconnect>,
    logging: Option<FileLogging>,
    metrics_addr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRelay {
    addr: Option<String>,
    user: Option<String>,
    password: Option<String>,
    key_file: Option<String>,
    key_passphrase: Option<String>,
    host_key: Option<String>,
    #[serde(default)]
    hide_banner: bool,
    control_command: Option<String>,
    proxy: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileEndpoint {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTimeouts {
    connect_timeout_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    target_dial_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileReconnect {
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}
