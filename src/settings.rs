use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::policy::{AccessPolicy, compile::parse_rule_list};
use crate::proxy::upstream::ResolveOverride;

const ENV_PREFIX: &str = "GH_PROXY";

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout() -> u64 {
    3600
}

fn default_size_limit() -> u64 {
    1024 * 1024 * 1024 * 999
}

fn default_chunk_size() -> usize {
    10_240
}

fn default_client_timeout() -> u64 {
    30
}

fn default_max_request_header_size() -> usize {
    32 * 1024
}

fn default_max_response_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub debug: bool,
    /// Total budget in seconds for one upstream exchange, redirects and streaming included.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub jsdelivr: bool,
    /// Declared upstream Content-Length above which the client is redirected to the source.
    #[serde(default = "default_size_limit")]
    pub size_limit: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub white_list: String,
    #[serde(default)]
    pub black_list: String,
    #[serde(default)]
    pub pass_list: String,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_max_request_header_size")]
    pub max_request_header_size: usize,
    #[serde(default = "default_max_response_header_size")]
    pub max_response_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
    /// Upstream addresses pinned by `host:port`, bypassing DNS.
    #[serde(default)]
    pub resolve: Vec<ResolveOverride>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            timeout: default_timeout(),
            jsdelivr: false,
            size_limit: default_size_limit(),
            chunk_size: default_chunk_size(),
            white_list: String::new(),
            black_list: String::new(),
            pass_list: String::new(),
            log: default_log_format(),
            client_timeout: default_client_timeout(),
            max_request_header_size: default_max_request_header_size(),
            max_response_header_size: default_max_response_header_size(),
            max_request_body_size: default_max_request_body_size(),
            metrics_listen: None,
            resolve: Vec::new(),
        }
    }
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = resolve_config_path(cli);
        Self::from_sources(config_path.as_deref(), environment())
    }

    pub(crate) fn from_sources(file: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }
        builder = builder.add_source(env);

        let cfg = builder.build().map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn bind_target(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn access_policy(&self) -> AccessPolicy {
        AccessPolicy::new(
            parse_rule_list(&self.white_list),
            parse_rule_list(&self.black_list),
            parse_rule_list(&self.pass_list),
        )
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.host.trim().is_empty(), "host must not be empty");
        ensure!(self.port > 0, "port must be greater than 0");
        ensure!(
            self.timeout > 0,
            "timeout must be greater than 0 seconds (got {})",
            self.timeout
        );
        ensure!(
            self.size_limit > 0,
            "size_limit must be greater than 0 (got {})",
            self.size_limit
        );
        ensure!(
            self.chunk_size > 0,
            "chunk_size must be greater than 0 (got {})",
            self.chunk_size
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.max_request_header_size > 0,
            "max_request_header_size must be greater than 0 (got {})",
            self.max_request_header_size
        );
        ensure!(
            self.max_response_header_size > 0,
            "max_response_header_size must be greater than 0 (got {})",
            self.max_response_header_size
        );
        ensure!(
            self.max_request_body_size > 0,
            "max_request_body_size must be greater than 0 (got {})",
            self.max_request_body_size
        );
        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("resolve")
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// An explicit `--config` must exist; the default locations are only used when present.
fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Some(path.to_path_buf());
    }
    default_config_candidates()
        .into_iter()
        .find(|candidate| candidate.exists())
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("ghproxy.toml"),
        PathBuf::from("/etc/ghproxy/ghproxy.toml"),
    ]
}
