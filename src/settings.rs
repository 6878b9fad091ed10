use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::error::CacheResult;
use crate::fingerprint::{BucketNaming, FingerprintOptions};
use crate::proxy::upstream::Upstream;
use crate::storage::SharedConfig;
use crate::util::absolutize;

fn default_listen_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    8080
}

fn default_store_path() -> PathBuf {
    PathBuf::from("store")
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InboundScheme {
    #[default]
    Http,
    Https,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Embedded,
    Shared,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Upstream base URL, e.g. `http://127.0.0.1:9200`.
    pub host: String,
    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub port_from: Option<u16>,
    #[serde(default)]
    pub port_to: Option<u16>,
    #[serde(default)]
    pub buckets: Vec<String>,
    #[serde(default)]
    pub scheme: InboundScheme,
    #[serde(default)]
    pub pem_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub dynamic_file_name: bool,
    #[serde(default)]
    pub force_save: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub session_mode: bool,
    #[serde(default)]
    pub strip_host: bool,
    #[serde(default)]
    pub strip_user_info: bool,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub shared: Option<SharedConfig>,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Settings {
    /// Settings with every optional field at its default.
    pub fn new(host: impl Into<String>, store_path: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            listen_ip: default_listen_ip(),
            port: default_port(),
            port_from: None,
            port_to: None,
            buckets: Vec::new(),
            scheme: InboundScheme::Http,
            pem_path: None,
            key_path: None,
            store_path: store_path.into(),
            file_name: None,
            dynamic_file_name: false,
            force_save: false,
            verbose: false,
            session_mode: false,
            strip_host: false,
            strip_user_info: false,
            backend: BackendKind::Embedded,
            shared: None,
            log: default_log_format(),
            client_timeout: default_client_timeout(),
            upstream_connect_timeout: default_upstream_connect_timeout(),
            upstream_timeout: default_upstream_timeout(),
            max_header_size: default_max_header_size(),
            max_body_size: default_max_body_size(),
            metrics_listen: None,
        }
    }

    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));

        builder = builder.add_source(
            Environment::with_prefix("CACHEPROXY")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn upstream(&self) -> CacheResult<Upstream> {
        Upstream::parse(&self.host)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.port)
    }

    /// An empty or missing `file_name` forces per-URL bucket names.
    pub fn bucket_naming(&self) -> BucketNaming {
        match self.file_name.as_deref() {
            Some(name) if !name.is_empty() && !self.dynamic_file_name => BucketNaming::fixed(name),
            _ => BucketNaming::dynamic(),
        }
    }

    pub fn fingerprint_options(&self) -> FingerprintOptions {
        FingerprintOptions {
            strip_host: self.strip_host,
            strip_user_info: self.strip_user_info,
        }
    }

    /// Copy of these settings serving one fixed bucket on `port`.
    pub fn for_instance(&self, bucket: &str, port: u16) -> Self {
        let mut settings = self.clone();
        settings.file_name = Some(bucket.to_string());
        settings.dynamic_file_name = false;
        settings.port = port;
        settings
    }

    /// Manager port range, when both ends are configured.
    pub fn port_range(&self) -> Option<(u16, u16)> {
        self.port_from.zip(self.port_to)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("cacheproxy.toml"),
        PathBuf::from("/etc/cacheproxy/cacheproxy.toml"),
    ]
}

impl Settings {
    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.store_path = absolutize(&self.store_path, base_dir);
        self.pem_path = self.pem_path.as_ref().map(|path| absolutize(path, base_dir));
        self.key_path = self.key_path.as_ref().map(|path| absolutize(path, base_dir));
        if let Some(shared) = self.shared.as_mut() {
            shared.path = absolutize(&shared.path, base_dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.upstream()?;
        if self.scheme == InboundScheme::Https {
            ensure!(
                self.pem_path.is_some() && self.key_path.is_some(),
                "scheme = \"https\" requires both pem_path and key_path"
            );
        }
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_body_size > 0,
            "max_body_size must be greater than 0 (got {})",
            self.max_body_size
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        match (self.backend, &self.shared) {
            (BackendKind::Shared, None) => {
                bail!("backend = \"shared\" requires a [shared] section")
            }
            (BackendKind::Shared, Some(shared)) => shared.validate()?,
            (BackendKind::Embedded, _) => {}
        }
        ensure!(
            self.port_from.is_some() == self.port_to.is_some(),
            "port_from and port_to must both be set or both be absent"
        );
        if let Some((from, to)) = self.port_range() {
            ensure!(
                to >= from,
                "port_to ({to}) must not be lower than port_from ({from})"
            );
        }
        if !self.buckets.is_empty() {
            let (from, to) = self
                .port_range()
                .ok_or_else(|| anyhow::anyhow!("buckets require port_from and port_to"))?;
            let available = usize::from(to - from) + 1;
            ensure!(
                self.buckets.len() <= available,
                "{} buckets do not fit in ports {from}..={to}",
                self.buckets.len()
            );
        }
        Ok(())
    }
}
