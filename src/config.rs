use std::{collections::HashMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiToken {
    pub token: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub buffer_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            buffer_capacity: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub enabled: bool,
    pub image: String,
    pub host: String,
    pub base_port: u16,
    pub max_port: u16,
    pub memory_mb: u64,
    pub cpu_fraction: f64,
    pub pids_limit: u32,
    pub nofile_limit: u32,
    pub stop_grace: Duration,
    pub reconcile_interval: Duration,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "knowledge-exchange-mcp:latest".to_string(),
            host: "127.0.0.1".to_string(),
            base_port: 9100,
            max_port: 9999,
            memory_mb: 512,
            cpu_fraction: 0.5,
            pids_limit: 128,
            nofile_limit: 1024,
            stop_grace: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(120),
        }
    }
}

/// Present when this process serves exactly one exchange, which is how a
/// sandboxed instance is launched.
#[derive(Debug, Clone)]
pub struct SingleExchange {
    pub id: Option<uuid::Uuid>,
    pub slug: String,
    pub backend: String,
    pub config: Value,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_tokens: Vec<ApiToken>,
    pub bind_addr: String,
    pub bind_port: u16,
    pub public_base_url: String,
    pub exchanges_file: Option<PathBuf>,
    pub session: SessionSettings,
    pub sandbox: SandboxSettings,
    pub single_exchange: Option<SingleExchange>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MCP_API_TOKENS is required and must contain at least one token")]
    MissingApiTokens,
    #[error("MCP_API_TOKENS entry is malformed: {0}")]
    InvalidApiToken(String),
    #[error("{0} must be a valid u16")]
    InvalidPort(&'static str),
    #[error("{0} must be a positive integer")]
    InvalidNumber(&'static str),
    #[error("{0} must be true or false")]
    InvalidBool(&'static str),
    #[error("SANDBOX_CPU_FRACTION must be between 0.01 and 64")]
    InvalidCpuFraction,
    #[error("SANDBOX_BASE_PORT must not exceed SANDBOX_MAX_PORT")]
    InvalidPortRange,
    #[error("EXCHANGE_SLUG, EXCHANGE_BACKEND and EXCHANGE_CONFIG must be set together")]
    IncompleteSingleExchange,
    #[error("EXCHANGE_CONFIG must be a JSON object")]
    InvalidExchangeConfig,
    #[error("EXCHANGE_ID must be a UUID")]
    InvalidExchangeId,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| values.get(key).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_tokens = parse_api_tokens(get("MCP_API_TOKENS").as_deref())?;
        if api_tokens.is_empty() {
            return Err(ConfigError::MissingApiTokens);
        }

        let bind_addr = get("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = parse_port(get("BIND_PORT"), "BIND_PORT")?.unwrap_or(8080);
        let public_base_url = get("PUBLIC_BASE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://{bind_addr}:{bind_port}"));

        let defaults = SessionSettings::default();
        let session = SessionSettings {
            idle_timeout: parse_secs(get("SESSION_IDLE_TIMEOUT_SECS"), "SESSION_IDLE_TIMEOUT_SECS")?
                .unwrap_or(defaults.idle_timeout),
            sweep_interval: parse_secs(
                get("SESSION_SWEEP_INTERVAL_SECS"),
                "SESSION_SWEEP_INTERVAL_SECS",
            )?
            .unwrap_or(defaults.sweep_interval),
            buffer_capacity: parse_positive(get("SESSION_BUFFER_CAPACITY"), "SESSION_BUFFER_CAPACITY")?
                .map(|value| value as usize)
                .unwrap_or(defaults.buffer_capacity),
        };

        let sandbox = parse_sandbox(&get)?;
        let single_exchange = parse_single_exchange(&get)?;

        let config = Self {
            api_tokens,
            bind_addr,
            bind_port,
            public_base_url,
            exchanges_file: get("EXCHANGES_FILE").map(PathBuf::from),
            session,
            sandbox,
            single_exchange,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }

    /// The `MCP_API_TOKENS` value that reproduces this configuration's tokens,
    /// forwarded to sandboxed instances.
    pub fn api_tokens_env(&self) -> String {
        self.api_tokens
            .iter()
            .map(|entry| format!("{}={}", entry.token, entry.scopes.join(" ")))
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Parses `token=scope1 scope2;other=scope3`. A token without `=` gets the
/// default `exchange:read` scope.
fn parse_api_tokens(raw: Option<&str>) -> Result<Vec<ApiToken>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (token, scopes) = match entry.split_once('=') {
                Some((token, scopes)) => (
                    token.trim(),
                    scopes.split_whitespace().map(str::to_string).collect(),
                ),
                None => (entry, vec![crate::auth::SCOPE_EXCHANGE_READ.to_string()]),
            };
            if token.is_empty() {
                return Err(ConfigError::InvalidApiToken(entry.to_string()));
            }
            Ok(ApiToken {
                token: token.to_string(),
                scopes,
            })
        })
        .collect()
}

fn parse_port(value: Option<String>, key: &'static str) -> Result<Option<u16>, ConfigError> {
    value
        .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort(key)))
        .transpose()
}

fn parse_positive(value: Option<String>, key: &'static str) -> Result<Option<u64>, ConfigError> {
    value
        .map(|value| match value.parse::<u64>() {
            Ok(parsed) if parsed > 0 => Ok(parsed),
            _ => Err(ConfigError::InvalidNumber(key)),
        })
        .transpose()
}

fn parse_secs(value: Option<String>, key: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_positive(value, key)?.map(Duration::from_secs))
}

fn parse_bool(value: Option<String>, key: &'static str) -> Result<Option<bool>, ConfigError> {
    value
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool(key)),
        })
        .transpose()
}

fn parse_sandbox(get: &impl Fn(&str) -> Option<String>) -> Result<SandboxSettings, ConfigError> {
    let defaults = SandboxSettings::default();

    let cpu_fraction = get("SANDBOX_CPU_FRACTION")
        .map(|value| {
            value
                .parse::<f64>()
                .ok()
                .filter(|fraction| (0.01..=64.0).contains(fraction))
                .ok_or(ConfigError::InvalidCpuFraction)
        })
        .transpose()?
        .unwrap_or(defaults.cpu_fraction);

    let settings = SandboxSettings {
        enabled: parse_bool(get("SANDBOX_ENABLED"), "SANDBOX_ENABLED")?.unwrap_or(defaults.enabled),
        image: get("SANDBOX_IMAGE").unwrap_or(defaults.image),
        host: get("SANDBOX_HOST").unwrap_or(defaults.host),
        base_port: parse_port(get("SANDBOX_BASE_PORT"), "SANDBOX_BASE_PORT")?
            .unwrap_or(defaults.base_port),
        max_port: parse_port(get("SANDBOX_MAX_PORT"), "SANDBOX_MAX_PORT")?
            .unwrap_or(defaults.max_port),
        memory_mb: parse_positive(get("SANDBOX_MEMORY_MB"), "SANDBOX_MEMORY_MB")?
            .unwrap_or(defaults.memory_mb),
        cpu_fraction,
        pids_limit: parse_positive(get("SANDBOX_PIDS_LIMIT"), "SANDBOX_PIDS_LIMIT")?
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(defaults.pids_limit),
        nofile_limit: parse_positive(get("SANDBOX_NOFILE_LIMIT"), "SANDBOX_NOFILE_LIMIT")?
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(defaults.nofile_limit),
        stop_grace: parse_secs(get("SANDBOX_STOP_GRACE_SECS"), "SANDBOX_STOP_GRACE_SECS")?
            .unwrap_or(defaults.stop_grace),
        reconcile_interval: parse_secs(get("SANDBOX_RECONCILE_SECS"), "SANDBOX_RECONCILE_SECS")?
            .unwrap_or(defaults.reconcile_interval),
    };

    if settings.base_port > settings.max_port {
        return Err(ConfigError::InvalidPortRange);
    }

    Ok(settings)
}

fn parse_single_exchange(
    get: &impl Fn(&str) -> Option<String>,
) -> Result<Option<SingleExchange>, ConfigError> {
    match (get("EXCHANGE_SLUG"), get("EXCHANGE_BACKEND"), get("EXCHANGE_CONFIG")) {
        (None, None, None) => Ok(None),
        (Some(slug), Some(backend), Some(raw_config)) => {
            let config: Value =
                serde_json::from_str(&raw_config).map_err(|_| ConfigError::InvalidExchangeConfig)?;
            if !config.is_object() {
                return Err(ConfigError::InvalidExchangeConfig);
            }
            let id = get("EXCHANGE_ID")
                .map(|value| value.parse().map_err(|_| ConfigError::InvalidExchangeId))
                .transpose()?;
            Ok(Some(SingleExchange {
                id,
                slug,
                backend,
                config,
            }))
        }
        _ => Err(ConfigError::IncompleteSingleExchange),
    }
}
