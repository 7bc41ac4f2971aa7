//! Server configuration.

use serde::Deserialize;

/// Server settings loaded from environment variables.
///
/// Environment variables are prefixed with `WAYPOINT_`:
/// - `WAYPOINT_HOST`: interface to bind (default: 0.0.0.0)
/// - `WAYPOINT_PORT`: port to bind (default: 8080)
/// - `WAYPOINT_DATABASE_URL`: SQLite task store (default: sqlite:waypoint.db?mode=rwc)
/// - `WAYPOINT_UNIT_SOURCE_URL`: service listing an owner's work units
/// - `WAYPOINT_PROCESSOR_URL`: primary work unit processor
/// - `WAYPOINT_FALLBACK_PROCESSOR_URL`: processor tried when the primary fails
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default)]
    pub unit_source_url: Option<String>,

    #[serde(default)]
    pub processor_url: Option<String>,

    #[serde(default)]
    pub fallback_processor_url: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "sqlite:waypoint.db?mode=rwc".to_string()
}

impl ServerConfig {
    /// Load configuration from `WAYPOINT_`-prefixed environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("WAYPOINT_").from_env::<ServerConfig>()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_url: default_database_url(),
            unit_source_url: None,
            processor_url: None,
            fallback_processor_url: None,
        }
    }
}
