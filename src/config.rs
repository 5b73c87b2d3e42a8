use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::TransferError;

// Transfer defaults
pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 23; // 8MB
pub const DEFAULT_BUFFER_SIZE: u64 = 64 * 1024; // 64KB
pub const DEFAULT_PARALLEL_STREAMS: usize = 16;

// Network defaults
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_TCP_PORT: u16 = 8081;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
pub const RETRY_DELAY_MS: u64 = 500;
pub const MAX_CONNECTIONS: usize = 256;

// Session lifetimes
pub const SESSION_TTL_SECONDS: u64 = 60 * 60;
pub const COMPLETED_TTL_SECONDS: u64 = 24 * 60 * 60;
pub const MERGE_LOCK_TTL_SECONDS: u64 = 5 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    pub http_port: u16,
    pub tcp_port: u16,
    pub output_directory: String,
    pub max_connections: usize,
    pub read_timeout_seconds: u64,
    pub session_ttl_seconds: u64,
    pub completed_ttl_seconds: u64,
    pub merge_lock_ttl_seconds: u64,
    pub retain_chunks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_address: String,
    pub http_port: u16,
    pub tcp_port: u16,
    #[serde(with = "size_expr")]
    pub chunk_size: u64,
    #[serde(with = "size_expr")]
    pub buffer_size: u64,
    pub parallel_streams: usize,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub progress_bar_enabled: bool,
}

impl Config {
    pub fn load_or_create(path: &PathBuf) -> Result<Self, TransferError> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save(path)?;
            tracing::info!("Created default config file at {}", path.display());
            Ok(config)
        }
    }

    pub fn save(&self, path: &PathBuf) -> Result<(), TransferError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.client.chunk_size == 0 {
            return Err(TransferError::ConfigError("client.chunk_size must be positive".to_string()));
        }
        if self.client.buffer_size == 0 {
            return Err(TransferError::ConfigError("client.buffer_size must be positive".to_string()));
        }
        if self.client.parallel_streams == 0 {
            return Err(TransferError::ConfigError("client.parallel_streams must be positive".to_string()));
        }
        if self.server.max_connections == 0 {
            return Err(TransferError::ConfigError("server.max_connections must be positive".to_string()));
        }
        if self.server.merge_lock_ttl_seconds == 0 {
            return Err(TransferError::ConfigError("server.merge_lock_ttl_seconds must be positive".to_string()));
        }
        Ok(())
    }
}

impl ServerConfig {
    pub fn http_bind(&self) -> String {
        format!("{}:{}", self.address, self.http_port)
    }

    pub fn tcp_bind(&self) -> String {
        format!("{}:{}", self.address, self.tcp_port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }
}

impl ClientConfig {
    pub fn registration_url(&self) -> String {
        format!("http://{}:{}/getFileTransferInfo", self.server_address, self.http_port)
    }

    pub fn data_address(&self) -> String {
        format!("{}:{}", self.server_address, self.tcp_port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            output_directory: "./downloads".to_string(),
            max_connections: MAX_CONNECTIONS,
            read_timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            session_ttl_seconds: SESSION_TTL_SECONDS,
            completed_ttl_seconds: COMPLETED_TTL_SECONDS,
            merge_lock_ttl_seconds: MERGE_LOCK_TTL_SECONDS,
            retain_chunks: false,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            parallel_streams: DEFAULT_PARALLEL_STREAMS,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            retry_attempts: MAX_RETRY_ATTEMPTS,
            retry_delay_ms: RETRY_DELAY_MS,
            progress_bar_enabled: true,
        }
    }
}

/// Parses a size written either as a plain number or as `1 << N`.
pub fn parse_size_expr(expression: &str) -> Result<u64, String> {
    let expression = expression.trim();
    if let Ok(value) = expression.parse::<u64>() {
        return Ok(value);
    }

    let (base, shift) = expression
        .split_once("<<")
        .ok_or_else(|| format!("invalid size expression: {expression}"))?;
    let base: u64 = base
        .trim()
        .parse()
        .map_err(|_| format!("invalid size expression: {expression}"))?;
    let shift: u32 = shift
        .trim()
        .parse()
        .map_err(|_| format!("invalid size expression: {expression}"))?;

    base.checked_shl(shift)
        .filter(|value| value >> shift == base)
        .ok_or_else(|| format!("size expression overflows: {expression}"))
}

mod size_expr {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(u64),
        Expression(String),
    }

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(*value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match SizeValue::deserialize(deserializer)? {
            SizeValue::Number(value) => Ok(value),
            SizeValue::Expression(expr) => {
                super::parse_size_expr(&expr).map_err(serde::de::Error::custom)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.server.address, "127.0.0.1");
        assert_eq!(config.server.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(config.server.tcp_port, DEFAULT_TCP_PORT);
        assert_eq!(config.client.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.client.parallel_streams, DEFAULT_PARALLEL_STREAMS);
        assert!(!config.server.retain_chunks);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_addresses() {
        let config = ClientConfig::default();

        assert_eq!(config.registration_url(), "http://127.0.0.1:8080/getFileTransferInfo");
        assert_eq!(config.data_address(), "127.0.0.1:8081");
        assert_eq!(config.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECONDS));
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        let mut original_config = Config::default();
        original_config.client.chunk_size = 4_000_000;
        original_config.save(&config_path).unwrap();

        let loaded_config = Config::load_or_create(&config_path).unwrap();

        assert_eq!(original_config.server.address, loaded_config.server.address);
        assert_eq!(original_config.server.tcp_port, loaded_config.server.tcp_port);
        assert_eq!(loaded_config.client.chunk_size, 4_000_000);
    }

    #[test]
    fn test_config_create_new() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("new_config.toml");

        let config = Config::load_or_create(&config_path).unwrap();

        assert!(config_path.exists());
        assert_eq!(config.server.output_directory, "./downloads");
    }

    #[test]
    fn test_size_expression_in_toml() {
        let mut config = Config::default();
        let mut text = toml::to_string(&config).unwrap();
        text = text.replace(
            &format!("chunk_size = {}", DEFAULT_CHUNK_SIZE),
            "chunk_size = \"1 << 20\"",
        );

        config = toml::from_str(&text).unwrap();
        assert_eq!(config.client.chunk_size, 1 << 20);
    }

    #[test]
    fn test_parse_size_expr() {
        assert_eq!(parse_size_expr("1024"), Ok(1024));
        assert_eq!(parse_size_expr("1 << 10"), Ok(1024));
        assert_eq!(parse_size_expr(" 1<<23 "), Ok(1 << 23));
        assert!(parse_size_expr("1 >> 3").is_err());
        assert!(parse_size_expr("1 << x").is_err());
        assert!(parse_size_expr("2 << 63").is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.client.chunk_size = 0;

        match config.validate() {
            Err(TransferError::ConfigError(msg)) => assert!(msg.contains("chunk_size")),
            other => panic!("Expected ConfigError, got {:?}", other),
        }
    }
}
