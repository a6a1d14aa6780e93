//! Server configuration

/// Environment-derived settings for the API server
#[derive(Debug, Clone)]
pub struct Config {
    /// Pooler URL used for regular queries
    pub database_url: String,
    /// Direct URL for migrations (PgBouncer does not support prepared statements)
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    pub run_migrations: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let run_migrations = match std::env::var("RUN_MIGRATIONS") {
            Ok(value) => parse_flag("RUN_MIGRATIONS", &value)?,
            Err(_) => true,
        };

        Ok(Self {
            database_url,
            database_direct_url: std::env::var("DATABASE_DIRECT_URL")
                .ok()
                .filter(|v| !v.is_empty()),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            run_migrations,
        })
    }

    pub fn migration_url(&self) -> &str {
        self.database_direct_url
            .as_deref()
            .unwrap_or(&self.database_url)
    }
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("X", "true").unwrap());
        assert!(parse_flag("X", " ON ").unwrap());
        assert!(!parse_flag("X", "0").unwrap());
        assert!(matches!(
            parse_flag("X", "maybe"),
            Err(ConfigError::Invalid { name: "X", .. })
        ));
    }

    #[test]
    fn test_migration_url_prefers_direct() {
        let mut config = Config {
            database_url: "postgres://pooler/db".into(),
            database_direct_url: None,
            bind_address: "127.0.0.1:0".into(),
            run_migrations: true,
        };
        assert_eq!(config.migration_url(), "postgres://pooler/db");

        config.database_direct_url = Some("postgres://direct/db".into());
        assert_eq!(config.migration_url(), "postgres://direct/db");
    }
}
