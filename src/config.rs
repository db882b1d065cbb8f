//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub admin: AdminConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Actor URI for a local username
    pub fn actor_uri(&self, username: &str) -> String {
        format!("{}/users/{}", self.base_url(), username)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Admin identity configuration
///
/// The admin actor signs outbound system traffic such as resolver fetches.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Admin username (default: "admin")
    #[serde(default = "default_admin_username")]
    pub username: String,
    /// Admin display name (default: "Admin")
    #[serde(default = "default_admin_display_name")]
    pub display_name: String,
    /// Admin bio/note
    pub note: Option<String>,
}

fn default_admin_username() -> String {
    "admin".to_string()
}

fn default_admin_display_name() -> String {
    "Admin".to_string()
}

/// Federation engine tuning
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Sleep between delivery processor cycles (default: 30)
    pub delivery_interval_seconds: u64,
    /// Rows selected per cycle (default: 50)
    pub batch_size: i64,
    /// Attempt ceiling after which rows are dead-lettered (default: 3)
    pub max_attempts: i64,
    /// Per-call timeout for outbound federation requests (default: 10)
    pub request_timeout_seconds: u64,
    /// RSA modulus size for new local actors (default: 2048)
    pub key_bits: usize,
    /// Public key cache TTL (default: 3600)
    pub key_cache_ttl_seconds: u64,
    /// Answer inbound Follows for local actors with an Accept (default: true)
    pub send_accept: bool,
    /// User-Agent for outbound requests
    pub user_agent: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (TUSKER__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("server.domain", "localhost")?
            .set_default("database.path", "data/tusker.db")?
            .set_default("federation.delivery_interval_seconds", 30)?
            .set_default("federation.batch_size", 50)?
            .set_default("federation.max_attempts", 3)?
            .set_default("federation.request_timeout_seconds", 10)?
            .set_default("federation.key_bits", 2048)?
            .set_default("federation.key_cache_ttl_seconds", 3600)?
            .set_default("federation.send_accept", true)?
            .set_default(
                "federation.user_agent",
                concat!("Tusker/", env!("CARGO_PKG_VERSION")),
            )?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (TUSKER__*)
            .add_source(
                Environment::with_prefix("TUSKER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        let federation = &self.federation;

        if federation.delivery_interval_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if federation.batch_size <= 0 {
            return Err(crate::error::AppError::Config(
                "federation.batch_size must be greater than 0".to_string(),
            ));
        }

        if federation.max_attempts <= 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_attempts must be greater than 0".to_string(),
            ));
        }

        if federation.request_timeout_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "federation.request_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if federation.key_bits < 1024 {
            return Err(crate::error::AppError::Config(
                "federation.key_bits must be at least 1024".to_string(),
            ));
        }

        if is_local_server_domain(&self.server.domain) {
            if !self.server.protocol.eq_ignore_ascii_case("https") {
                tracing::warn!(
                    domain = %self.server.domain,
                    protocol = %self.server.protocol,
                    "Federating over plain HTTP for local development"
                );
            }
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/tusker-test.db"),
            },
            admin: AdminConfig {
                username: "admin".to_string(),
                display_name: "Admin".to_string(),
                note: None,
            },
            federation: FederationConfig {
                delivery_interval_seconds: 30,
                batch_size: 50,
                max_attempts: 3,
                request_timeout_seconds: 10,
                key_bits: 2048,
                key_cache_ttl_seconds: 3600,
                send_accept: true,
                user_agent: "Tusker/test".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_http_on_localhost() {
        let config = valid_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_http_for_non_local_domain() {
        let mut config = valid_config();
        config.server.domain = "social.example.com".to_string();
        config.server.protocol = "http".to_string();

        let error = config
            .validate()
            .expect_err("public domains must require https");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("server.protocol must be https")
        ));
    }

    #[test]
    fn validate_rejects_zero_attempt_ceiling() {
        let mut config = valid_config();
        config.federation.max_attempts = 0;

        let error = config
            .validate()
            .expect_err("zero attempts must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("federation.max_attempts")
        ));
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let mut config = valid_config();
        config.federation.delivery_interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn actor_uri_uses_base_url() {
        let config = valid_config();
        assert_eq!(
            config.server.actor_uri("alice"),
            "http://localhost/users/alice"
        );
    }
}
