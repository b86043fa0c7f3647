use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub database: DatabaseConfig,
    pub tileserver: TileServerConfig,
    pub map: MapConfig,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// LLM provider configuration: keys, model ids, embedding dimension.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: String,
    pub api_base: String,
    /// Model used for tool-calling chat completions.
    pub inference_model: String,
    /// Model used for structured-parse calls (plan generation, smart-query term expansion).
    pub parsing_model: String,
    pub embedding_model: String,
    pub embedding_dims: usize,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    /// Base schema holding the always-registered tables (outside per-analysis schemas).
    pub base_schema: String,
    /// Role granted SELECT on analysis output tables so pg_tileserv can read them.
    pub tileserv_role: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TileServerConfig {
    pub base_url: String,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    pub default_srid: i32,
    pub geometry_column: String,
    pub default_table: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub docstore_root: String,
    pub template_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone)]
#[command(name = "geoagent")]
#[command(version, about = "GeoAgent - LLM-driven geospatial analysis service")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// LLM provider API key (overrides config file)
    #[arg(long, value_name = "KEY")]
    pub llm_api_key: Option<String>,

    /// LLM inference model id (overrides config file)
    #[arg(long, value_name = "MODEL")]
    pub llm_inference_model: Option<String>,

    /// Tile server base URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub tileserver_url: Option<String>,

    /// Logging level (overrides config file, e.g., "info,geoagent=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// LLM request timeout (overrides config file, e.g., "30s", "2m")
    #[arg(long, value_name = "DURATION")]
    pub llm_timeout_secs: Option<String>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with GEOAGENT_)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();

        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.derive_database_url();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - GEOAGENT_SERVER_HOST / GEOAGENT_SERVER_PORT
    /// - GEOAGENT_DATABASE_URL
    /// - GEOAGENT_LLM_API_KEY / GEOAGENT_LLM_INFERENCE_MODEL
    /// - GEOAGENT_TILESERVER_URL
    /// - GEOAGENT_LOG_LEVEL
    /// - GEOAGENT_LLM_TIMEOUT_SECS (accepts "30s", "5m", "1h")
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("GEOAGENT_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("GEOAGENT_SERVER_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
        }
        if let Ok(db_url) = std::env::var("GEOAGENT_DATABASE_URL") {
            self.database.url = db_url;
        }
        if let Ok(key) = std::env::var("GEOAGENT_LLM_API_KEY") {
            self.llm.api_key = key;
        }
        if let Ok(model) = std::env::var("GEOAGENT_LLM_INFERENCE_MODEL") {
            self.llm.inference_model = model;
        }
        if let Ok(url) = std::env::var("GEOAGENT_TILESERVER_URL") {
            self.tileserver.base_url = url;
        }
        if let Ok(level) = std::env::var("GEOAGENT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(timeout) = std::env::var("GEOAGENT_LLM_TIMEOUT_SECS") {
            match parse_duration_to_secs(&timeout) {
                Ok(val) => self.llm.request_timeout_secs = val,
                Err(e) => tracing::warn!(
                    "Invalid GEOAGENT_LLM_TIMEOUT_SECS '{}': {} (keep {})",
                    timeout,
                    e,
                    self.llm.request_timeout_secs
                ),
            }
        }
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.server_port {
            self.server.port = port;
        }
        if let Some(db_url) = &args.database_url {
            self.database.url = db_url.clone();
        }
        if let Some(key) = &args.llm_api_key {
            self.llm.api_key = key.clone();
        }
        if let Some(model) = &args.llm_inference_model {
            self.llm.inference_model = model.clone();
        }
        if let Some(url) = &args.tileserver_url {
            self.tileserver.base_url = url.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if let Some(timeout) = &args.llm_timeout_secs {
            match parse_duration_to_secs(timeout) {
                Ok(val) => self.llm.request_timeout_secs = val,
                Err(e) => tracing::warn!(
                    "Invalid --llm-timeout-secs '{}': {} (keep {})",
                    timeout,
                    e,
                    self.llm.request_timeout_secs
                ),
            }
        }
    }

    /// Derive `database.url` from discrete fields if it was left blank, matching
    /// the original configuration's auto-derivation behaviour.
    fn derive_database_url(&mut self) {
        if self.database.url.is_empty() {
            self.database.url = format!(
                "postgres://{}:{}@{}:{}/{}",
                self.database.user,
                self.database.password,
                self.database.host,
                self.database.port,
                self.database.name
            );
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.llm.api_key == "no-key" {
            tracing::warn!("No LLM API key configured; set GEOAGENT_LLM_API_KEY");
        }

        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.llm.embedding_dims == 0 {
            anyhow::bail!("llm.embedding_dims must be > 0");
        }

        if self.tileserver.base_url.is_empty() {
            anyhow::bail!("tileserver.base_url cannot be empty");
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: "no-key".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            inference_model: "gpt-4o".to_string(),
            parsing_model: "o4-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dims: 1536,
            request_timeout_secs: 120,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            host: "localhost".to_string(),
            port: 5432,
            name: "geodb".to_string(),
            user: "gisuser".to_string(),
            password: "pw".to_string(),
            base_schema: "base".to_string(),
            tileserv_role: "pg_database_owner".to_string(),
            max_connections: 10,
        }
    }
}

impl Default for TileServerConfig {
    fn default() -> Self {
        Self { base_url: "http://127.0.0.1:7800".to_string(), request_timeout_secs: 10 }
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self { default_srid: 3857, geometry_column: "geometry".to_string(), default_table: "pluto".to_string() }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self { docstore_root: "./docstore".to_string(), template_dir: "./templates".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info,geoagent=debug".to_string(), file: Some("logs/geoagent.log".to_string()) }
    }
}

// =========================
// Helpers for parsing values
// =========================

fn parse_duration_to_secs(input: &str) -> Result<u64, String> {
    if let Ok(val) = input.parse::<u64>() {
        return Ok(val);
    }

    let s = input.trim().to_lowercase();
    let (num_str, unit) = s.split_at(s.chars().take_while(|c| c.is_ascii_digit()).count());
    if num_str.is_empty() || unit.is_empty() {
        return Err("missing number or unit".into());
    }
    let n: u64 = num_str.parse().map_err(|_| "invalid number".to_string())?;
    match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => Ok(n),
        "m" | "min" | "mins" | "minute" | "minutes" => Ok(n * 60),
        "h" | "hr" | "hour" | "hours" => Ok(n * 60 * 60),
        _ => Err(format!("unsupported unit: {}", unit)),
    }
}

/// Accepts either a bare number of seconds or a human-friendly duration string.
fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Visitor;
    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = u64;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a number of seconds or a string like '30s', '5m', '1h'")
        }
        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if v >= 0 { Ok(v as u64) } else { Err(E::custom("negative not allowed")) }
        }
        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(v).map_err(E::custom)
        }
        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(&v).map_err(E::custom)
        }
    }
    deserializer.deserialize_any(Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let mut config = Config::default();
        config.derive_database_url();
        assert!(config.validate().is_ok());
        assert!(config.database.url.starts_with("postgres://"));
    }

    #[test]
    fn explicit_database_url_is_not_overwritten() {
        let mut config = Config::default();
        config.database.url = "postgres://custom/db".to_string();
        config.derive_database_url();
        assert_eq!(config.database.url, "postgres://custom/db");
    }

    #[test]
    fn rejects_zero_port() {
        let mut config = Config::default();
        config.server.port = 0;
        config.derive_database_url();
        assert!(config.validate().is_err());
    }
}
