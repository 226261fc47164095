use std::env;

/// Opaque credential set for a single messaging transport. The core never
/// inspects these beyond passing them to the (out-of-scope) transport adapter.
#[derive(Debug, Clone)]
pub struct TransportCredentials {
    pub account_id: String,
    pub auth_token: String,
    pub bot_identifier: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Identity / environment
    pub app_name: String,
    pub environment: String,
    pub debug: bool,
    pub secret_key: String,

    // Server
    pub host: String,
    pub port: u16,

    // Relational store
    pub database_url: String,
    pub db_echo: bool,
    pub use_sqlite_fallback: bool,

    // KV store / queue
    pub redis_url: Option<String>,
    pub redis_enabled: bool,

    // Ledger
    pub ledger_network: String,
    pub ledger_node_url: String,
    pub ledger_node_token: String,
    pub ledger_indexer_url: String,
    pub ledger_indexer_token: String,

    // Crypto
    pub encryption_key: String,

    // Transports (opaque)
    pub transport_a: Option<TransportCredentials>,
    pub transport_b: Option<TransportCredentials>,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_per_minute: u32,

    // Logging
    pub log_level: String,
    pub log_file: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = require_env("DATABASE_URL")?;
        validate_db_url(&database_url)?;

        let ledger_node_url = require_env("LEDGER_NODE_URL")?;
        validate_rpc_url(&ledger_node_url, "LEDGER_NODE_URL")?;
        let ledger_indexer_url = require_env("LEDGER_INDEXER_URL")?;
        validate_rpc_url(&ledger_indexer_url, "LEDGER_INDEXER_URL")?;

        let encryption_key = require_env("ENCRYPTION_KEY")?;
        if encryption_key.len() < 16 {
            return Err(ConfigError::Invalid(
                "ENCRYPTION_KEY".into(),
                "must be at least 16 bytes".into(),
            ));
        }

        let redis_enabled = parse_env_or("REDIS_ENABLED", false)?;
        let redis_url = env::var("REDIS_URL").ok().filter(|s| !s.is_empty());
        if redis_enabled && redis_url.is_none() {
            return Err(ConfigError::Missing("REDIS_URL (REDIS_ENABLED=true)".into()));
        }

        let rate_limit_enabled = parse_env_or("RATE_LIMIT_ENABLED", true)?;
        let rate_limit_per_minute: u32 = parse_env_or("RATE_LIMIT_PER_MINUTE", 30)?;
        if rate_limit_enabled && rate_limit_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "RATE_LIMIT_PER_MINUTE".into(),
                "must be > 0 when rate limiting is enabled".into(),
            ));
        }

        Ok(Self {
            app_name: env::var("APP_NAME").unwrap_or_else(|_| "chatpay-core".into()),
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into()),
            debug: parse_env_or("DEBUG", false)?,
            secret_key: require_env("SECRET_KEY")?,

            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parse_env_or("PORT", 8080u16)?,

            database_url,
            db_echo: parse_env_or("DB_ECHO", false)?,
            use_sqlite_fallback: parse_env_or("USE_SQLITE_FALLBACK", false)?,

            redis_url,
            redis_enabled,

            ledger_network: env::var("LEDGER_NETWORK").unwrap_or_else(|_| "testnet".into()),
            ledger_node_url,
            ledger_node_token: env::var("LEDGER_NODE_TOKEN").unwrap_or_default(),
            ledger_indexer_url,
            ledger_indexer_token: env::var("LEDGER_INDEXER_TOKEN").unwrap_or_default(),

            encryption_key,

            transport_a: optional_transport("TRANSPORT_A"),
            transport_b: optional_transport("TRANSPORT_B"),

            rate_limit_enabled,
            rate_limit_per_minute,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            log_file: env::var("LOG_FILE").ok().filter(|s| !s.is_empty()),
        })
    }
}

fn optional_transport(prefix: &str) -> Option<TransportCredentials> {
    let account_id = env::var(format!("{prefix}_ACCOUNT_ID")).ok()?;
    let auth_token = env::var(format!("{prefix}_AUTH_TOKEN")).ok()?;
    let bot_identifier = env::var(format!("{prefix}_BOT_ID")).unwrap_or_default();
    if account_id.is_empty() || auth_token.is_empty() {
        return None;
    }
    Some(TransportCredentials {
        account_id,
        auth_token,
        bot_identifier,
    })
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    env::var(name)
        .map_err(|_| ConfigError::Missing(name.into()))
        .and_then(|v| {
            if v.is_empty() {
                Err(ConfigError::Missing(name.into()))
            } else {
                Ok(v)
            }
        })
}

fn parse_env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::Invalid(name.into(), format!("could not parse '{v}'"))),
        _ => Ok(default),
    }
}

fn validate_rpc_url(url: &str, name: &str) -> Result<(), ConfigError> {
    let lower = url.to_lowercase();
    if lower.starts_with("https://") {
        return Ok(());
    }
    if lower.starts_with("http://") {
        let host_part = lower.trim_start_matches("http://");
        if host_part.starts_with("localhost")
            || host_part.starts_with("127.0.0.1")
            || host_part.starts_with("[::1]")
        {
            return Ok(());
        }
        return Err(ConfigError::Invalid(
            name.into(),
            "must use HTTPS for non-localhost URLs".into(),
        ));
    }
    Err(ConfigError::Invalid(
        name.into(),
        "must start with https:// (or http:// for localhost)".into(),
    ))
}

fn validate_db_url(url: &str) -> Result<(), ConfigError> {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://")
        || lower.starts_with("postgresql://")
        || lower.starts_with("sqlite://")
        || lower.starts_with("sqlite:")
    {
        return Ok(());
    }
    Err(ConfigError::Invalid(
        "DATABASE_URL".into(),
        "must be a postgres:// or sqlite:// URL".into(),
    ))
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(String),
    Invalid(String, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(name) => write!(f, "missing required env var: {name}"),
            ConfigError::Invalid(name, reason) => {
                write!(f, "invalid env var {name}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
