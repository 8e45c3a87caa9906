use crate::error::{BatchError, Result};

/// Runtime configuration for the persistence core.
#[derive(Debug, Clone)]
pub struct BatchCoreConfig {
    pub database_url: String,
    /// Identity stamped onto executions this node runs.
    pub server_id: String,
    /// Batch REST url stamped alongside the server id.
    pub rest_url: String,
    pub max_connections: u32,
}

impl Default for BatchCoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/batch_development".to_string(),
            server_id: "localhost".to_string(),
            rest_url: "https://localhost:9443/ibm/api/batch".to_string(),
            max_connections: 10,
        }
    }
}

impl BatchCoreConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Ok(server_id) = std::env::var("BATCH_SERVER_ID") {
            config.server_id = server_id;
        }

        if let Ok(rest_url) = std::env::var("BATCH_REST_URL") {
            config.rest_url = rest_url;
        }

        if let Ok(max_connections) = std::env::var("BATCH_MAX_CONNECTIONS") {
            config.max_connections = max_connections.parse().map_err(|e| {
                BatchError::Configuration(format!("Invalid max_connections: {e}"))
            })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BatchCoreConfig::default();
        assert_eq!(config.max_connections, 10);
        assert!(!config.server_id.is_empty());
    }
}
