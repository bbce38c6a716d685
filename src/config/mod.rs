use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub security: SecurityConfig,
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Base connection URL; the path is swapped for the target database name
    pub url: Option<String>,
    /// Database holding the migration records, organizations and audit log
    pub system_db_name: String,
    /// Database holding shared multi-tenant collections
    pub shared_db_name: String,
    /// Maintenance database used for CREATE DATABASE
    pub admin_db_name: String,
    /// Template cloned when a dedicated target database does not exist yet
    pub tenant_template_db: Option<String>,
    pub max_connections: u32,
    pub connection_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub port: u16,
    pub enable_request_logging: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
    pub jwt_secret: String,
    pub jwt_expiry_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub default_chunk_size: u32,
    pub max_chunk_size: u32,
    /// Attempts per chunk before the copier gives up with ChunkCopyFailed
    pub chunk_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub chunk_write_timeout_ms: u64,
    /// Surfaced ChunkCopyFailed errors tolerated per collection before the migration fails
    pub max_consecutive_chunk_failures: u32,
    pub max_parallel_collections: usize,
    pub dedicated_db_prefix: String,
    /// Overrides the built-in collection catalog ("name" or "name:table:org_column", comma separated)
    pub collections: Option<String>,
}

impl MigrationConfig {
    pub fn chunk_write_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_write_timeout_ms)
    }

    /// Exponential backoff for the given retry attempt (1-based), capped at retry_max_delay_ms
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 100,
            max_chunk_size: 5000,
            chunk_retry_attempts: 3,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 5_000,
            chunk_write_timeout_ms: 30_000,
            max_consecutive_chunk_failures: 1,
            max_parallel_collections: 2,
            dedicated_db_prefix: "tenant_".to_string(),
            collections: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        // Set defaults based on environment, then override with specific env vars
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
        .with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        // Database overrides
        if let Ok(v) = env::var("DATABASE_URL") {
            self.database.url = Some(v);
        }
        if let Ok(v) = env::var("DATABASE_SYSTEM_DB") {
            self.database.system_db_name = v;
        }
        if let Ok(v) = env::var("DATABASE_SHARED_DB") {
            self.database.shared_db_name = v;
        }
        if let Ok(v) = env::var("DATABASE_ADMIN_DB") {
            self.database.admin_db_name = v;
        }
        if let Ok(v) = env::var("DATABASE_TENANT_TEMPLATE") {
            self.database.tenant_template_db = Some(v).filter(|t| !t.is_empty());
        }
        if let Ok(v) = env::var("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = v.parse().unwrap_or(self.database.max_connections);
        }
        if let Ok(v) = env::var("DATABASE_CONNECTION_TIMEOUT") {
            self.database.connection_timeout = v.parse().unwrap_or(self.database.connection_timeout);
        }

        // API overrides
        if let Some(v) = env::var("MIGRATOR_PORT").ok().or_else(|| env::var("PORT").ok()) {
            self.api.port = v.parse().unwrap_or(self.api.port);
        }
        if let Ok(v) = env::var("API_ENABLE_REQUEST_LOGGING") {
            self.api.enable_request_logging = v.parse().unwrap_or(self.api.enable_request_logging);
        }

        // Security overrides
        if let Ok(v) = env::var("SECURITY_ENABLE_CORS") {
            self.security.enable_cors = v.parse().unwrap_or(self.security.enable_cors);
        }
        if let Ok(v) = env::var("SECURITY_CORS_ORIGINS") {
            self.security.cors_origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = env::var("JWT_SECRET") {
            self.security.jwt_secret = v;
        }
        if let Ok(v) = env::var("SECURITY_JWT_EXPIRY_HOURS") {
            self.security.jwt_expiry_hours = v.parse().unwrap_or(self.security.jwt_expiry_hours);
        }

        // Migration overrides
        let m = &mut self.migration;
        if let Ok(v) = env::var("MIGRATION_DEFAULT_CHUNK_SIZE") {
            m.default_chunk_size = v.parse().unwrap_or(m.default_chunk_size);
        }
        if let Ok(v) = env::var("MIGRATION_CHUNK_RETRY_ATTEMPTS") {
            m.chunk_retry_attempts = v.parse().unwrap_or(m.chunk_retry_attempts);
        }
        if let Ok(v) = env::var("MIGRATION_RETRY_BASE_DELAY_MS") {
            m.retry_base_delay_ms = v.parse().unwrap_or(m.retry_base_delay_ms);
        }
        if let Ok(v) = env::var("MIGRATION_CHUNK_WRITE_TIMEOUT_MS") {
            m.chunk_write_timeout_ms = v.parse().unwrap_or(m.chunk_write_timeout_ms);
        }
        if let Ok(v) = env::var("MIGRATION_MAX_CONSECUTIVE_FAILURES") {
            m.max_consecutive_chunk_failures = v.parse().unwrap_or(m.max_consecutive_chunk_failures);
        }
        if let Ok(v) = env::var("MIGRATION_MAX_PARALLEL_COLLECTIONS") {
            m.max_parallel_collections = v.parse().unwrap_or(m.max_parallel_collections);
        }
        if let Ok(v) = env::var("MIGRATION_DEDICATED_DB_PREFIX") {
            m.dedicated_db_prefix = v;
        }
        if let Ok(v) = env::var("MIGRATION_COLLECTIONS") {
            m.collections = Some(v);
        }

        self
    }

    fn development() -> Self {
        Self {
            environment: Environment::Development,
            database: DatabaseConfig {
                url: None,
                system_db_name: "migrator_main".to_string(),
                shared_db_name: "shared_main".to_string(),
                admin_db_name: "postgres".to_string(),
                tenant_template_db: Some("tenant_template".to_string()),
                max_connections: 10,
                connection_timeout: 30,
            },
            api: ApiConfig {
                port: 3000,
                enable_request_logging: true,
            },
            security: SecurityConfig {
                enable_cors: true,
                cors_origins: vec!["http://localhost:3000".to_string(), "http://localhost:5173".to_string()],
                jwt_secret: "development-secret".to_string(),
                jwt_expiry_hours: 24 * 7, // 1 week
            },
            migration: MigrationConfig::default(),
        }
    }

    fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            database: DatabaseConfig {
                url: None,
                system_db_name: "migrator_main".to_string(),
                shared_db_name: "shared_main".to_string(),
                admin_db_name: "postgres".to_string(),
                tenant_template_db: Some("tenant_template".to_string()),
                max_connections: 20,
                connection_timeout: 10,
            },
            api: ApiConfig {
                port: 3000,
                enable_request_logging: true,
            },
            security: SecurityConfig {
                enable_cors: true,
                cors_origins: vec!["https://staging.example.com".to_string()],
                jwt_secret: String::new(),
                jwt_expiry_hours: 24,
            },
            migration: MigrationConfig {
                max_parallel_collections: 4,
                ..MigrationConfig::default()
            },
        }
    }

    fn production() -> Self {
        Self {
            environment: Environment::Production,
            database: DatabaseConfig {
                url: None,
                system_db_name: "migrator_main".to_string(),
                shared_db_name: "shared_main".to_string(),
                admin_db_name: "postgres".to_string(),
                tenant_template_db: Some("tenant_template".to_string()),
                max_connections: 50,
                connection_timeout: 5,
            },
            api: ApiConfig {
                port: 3000,
                enable_request_logging: false,
            },
            security: SecurityConfig {
                enable_cors: true,
                cors_origins: vec!["https://app.example.com".to_string()],
                jwt_secret: String::new(),
                jwt_expiry_hours: 4,
            },
            migration: MigrationConfig {
                chunk_retry_attempts: 5,
                max_consecutive_chunk_failures: 2,
                max_parallel_collections: 4,
                ..MigrationConfig::default()
            },
        }
    }
}

// Global singleton config - initialized once at startup by the binaries
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

pub fn config() -> &'static AppConfig {
    &CONFIG
}

#[macro_export]
macro_rules! is_production {
    () => {
        matches!($crate::config::CONFIG.environment, $crate::config::Environment::Production)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_development_config() {
        let config = AppConfig::development();
        assert_eq!(config.migration.default_chunk_size, 100);
        assert_eq!(config.migration.max_chunk_size, 5000);
        assert!(!config.security.jwt_secret.is_empty());
    }

    #[test]
    fn test_default_production_config() {
        let config = AppConfig::production();
        assert!(config.security.jwt_secret.is_empty());
        assert_eq!(config.migration.chunk_retry_attempts, 5);
        assert!(!config.api.enable_request_logging);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let m = MigrationConfig {
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 350,
            ..MigrationConfig::default()
        };
        assert_eq!(m.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(m.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(m.backoff_delay(3), Duration::from_millis(350));
        assert_eq!(m.backoff_delay(40), Duration::from_millis(350));
    }
}
