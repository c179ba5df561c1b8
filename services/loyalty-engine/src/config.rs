use config::{ConfigError, Environment, File};
use loyalty_core::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub accrual: AccrualConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// `host:port` to bind
    pub address: String,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AccrualConfig {
    /// Base URL of the accrual service
    pub endpoint: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    /// HS256 secret shared with the token issuer
    pub jwt_secret: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.address", "0.0.0.0:8080")?
            .set_default("server.workers", 4)?
            .set_default("database.url", "")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 5)?
            .set_default("accrual.endpoint", "http://localhost:8081")?
            .set_default("auth.jwt_secret", "")?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("LOYALTY_ENGINE")
                .separator("__")
                .try_parsing(true),
        );

        // Variables the deployment has always used
        if let Ok(address) = env::var("RUN_ADDRESS") {
            builder = builder.set_override("server.address", address)?;
        }

        if let Ok(db_url) = env::var("DATABASE_URI") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(endpoint) = env::var("ACCRUAL_SYSTEM_ADDRESS") {
            builder = builder.set_override("accrual.endpoint", endpoint)?;
        }

        if let Ok(secret) = env::var("JWT_SECRET") {
            builder = builder.set_override("auth.jwt_secret", secret)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.address.is_empty() {
            return Err("Server address is required".to_string());
        }

        if self.server.workers == 0 {
            return Err("At least one HTTP worker is required".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }

        if self.database.min_connections > self.database.max_connections {
            return Err("Database min connections exceed max connections".to_string());
        }

        if self.auth.jwt_secret.is_empty() {
            return Err("JWT secret is required".to_string());
        }

        loyalty_core::client::parse_endpoint(&self.accrual.endpoint).map_err(|e| e.to_string())?;
        self.pipeline.validate().map_err(|e| e.to_string())?;

        Ok(())
    }
}
