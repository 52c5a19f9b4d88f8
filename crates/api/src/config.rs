//! Server configuration (bind address, store selection).

use std::net::SocketAddr;

use tracing::warn;

use studyforge_infra::OrchestratorConfig;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    /// Back the job and program stores with Postgres instead of memory.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub orchestrator: OrchestratorConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            use_persistent_stores: false,
            database_url: None,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let bind_addr = match lookup("STUDYFORGE_BIND_ADDR") {
            None => default_bind_addr(),
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(key = "STUDYFORGE_BIND_ADDR", value = %raw, "invalid address, using default");
                default_bind_addr()
            }),
        };

        let use_persistent_stores = lookup("USE_PERSISTENT_STORES")
            .map(|raw| raw.trim().parse::<bool>().unwrap_or(false))
            .unwrap_or(false);

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        Self {
            bind_addr,
            use_persistent_stores,
            database_url,
            orchestrator: OrchestratorConfig::from_lookup(&lookup),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = ApiConfig::from_lookup(lookup(&[]));
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:8080");
        assert!(!config.use_persistent_stores);
        assert!(config.database_url.is_none());
        assert_eq!(config.orchestrator.max_retries, 3);
    }

    #[test]
    fn reads_server_and_orchestrator_keys() {
        let config = ApiConfig::from_lookup(lookup(&[
            ("STUDYFORGE_BIND_ADDR", "127.0.0.1:9000"),
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/studyforge"),
            ("STUDYFORGE_MAX_RETRIES", "5"),
        ]));
        assert_eq!(config.bind_addr.port(), 9000);
        assert!(config.use_persistent_stores);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/studyforge")
        );
        assert_eq!(config.orchestrator.max_retries, 5);
    }

    #[test]
    fn bad_values_fall_back() {
        let config = ApiConfig::from_lookup(lookup(&[
            ("STUDYFORGE_BIND_ADDR", "not-an-address"),
            ("USE_PERSISTENT_STORES", "yes please"),
            ("DATABASE_URL", "  "),
        ]));
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:8080");
        assert!(!config.use_persistent_stores);
        assert!(config.database_url.is_none());
    }
}
