//! Configuration types for Colloquy

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{ColloquyError, Result};

/// Main configuration for the orchestration service
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ColloquyConfig {
    /// HTTP listener configuration
    pub server: ServerConfig,

    /// Session memory configuration
    pub session: SessionConfig,

    /// Follow-up rewriting configuration
    pub rewriter: RewriterConfig,

    /// Response enhancement configuration
    pub enhancer: EnhancerConfig,

    /// Outbound dependency configuration
    pub dependencies: DependenciesConfig,

    /// Session persistence configuration
    pub persistence: PersistenceConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

/// Session memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum history entries kept per session (N)
    pub history_limit: usize,

    /// Maximum topics kept per session (M)
    pub topic_limit: usize,

    /// Default freshness window for entity lookups
    #[serde(with = "humantime_serde")]
    pub entity_max_age: Duration,

    /// Idle time after which a session expires
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// How often the background sweep runs
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// History entries echoed back in a chat reply
    pub response_history: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: 20,
            topic_limit: 5,
            entity_max_age: Duration::from_secs(30 * 60),
            idle_timeout: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60),
            response_history: 10,
        }
    }
}

impl SessionConfig {
    /// Builder: set history limit
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Builder: set topic limit
    pub fn with_topic_limit(mut self, limit: usize) -> Self {
        self.topic_limit = limit.max(1);
        self
    }

    /// Builder: set entity freshness window
    pub fn with_entity_max_age(mut self, max_age: Duration) -> Self {
        self.entity_max_age = max_age;
        self
    }

    /// Builder: set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Follow-up rewriting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriterConfig {
    /// Queries with at most this many tokens are treated as follow-ups
    pub follow_up_max_tokens: usize,

    /// Entities named in the context clause
    pub context_entities: usize,

    /// Topics named in the context clause
    pub context_topics: usize,
}

impl Default for RewriterConfig {
    fn default() -> Self {
        Self {
            follow_up_max_tokens: 4,
            context_entities: 2,
            context_topics: 3,
        }
    }
}

/// Response enhancement configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EnhancerConfig {
    /// Offset into the continuity phrase rotation
    pub rotation_seed: u64,
}

/// Outbound dependency configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DependenciesConfig {
    /// Intent classification service
    pub intent: DependencySettings,

    /// Answer retrieval service
    pub retrieval: RetrievalSettings,
}

impl Default for DependenciesConfig {
    fn default() -> Self {
        Self {
            intent: DependencySettings::new("http://localhost:8001"),
            retrieval: RetrievalSettings::default(),
        }
    }
}

/// Connection and breaker settings for one dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencySettings {
    /// Base URL of the service
    pub base_url: String,

    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// Cooldown before a probe is allowed
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,

    /// Upper bound on a single call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl DependencySettings {
    /// Settings with default breaker values for the given URL
    pub fn new(base_url: impl Into<String>) -> Self {
        let breaker = CircuitBreakerConfig::default();
        Self {
            base_url: base_url.into(),
            failure_threshold: breaker.failure_threshold,
            reset_timeout: breaker.reset_timeout,
            call_timeout: breaker.call_timeout,
        }
    }

    /// Breaker configuration derived from these settings
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(self.failure_threshold)
            .with_reset_timeout(self.reset_timeout)
            .with_call_timeout(self.call_timeout)
    }
}

impl Default for DependencySettings {
    fn default() -> Self {
        Self::new("http://localhost:8001")
    }
}

/// Retrieval service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Base URL of the service
    pub base_url: String,

    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// Cooldown before a probe is allowed
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,

    /// Upper bound on a single call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Number of passages requested
    pub top_k: usize,
}

impl RetrievalSettings {
    /// Connection and breaker settings without the retrieval-specific fields
    pub fn service(&self) -> DependencySettings {
        DependencySettings {
            base_url: self.base_url.clone(),
            failure_threshold: self.failure_threshold,
            reset_timeout: self.reset_timeout,
            call_timeout: self.call_timeout,
        }
    }
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        let service = DependencySettings::new("http://localhost:8002");
        Self {
            base_url: service.base_url,
            failure_threshold: service.failure_threshold,
            reset_timeout: service.reset_timeout,
            call_timeout: service.call_timeout,
            top_k: 3,
        }
    }
}

/// Session persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Backend selection
    pub backend: PersistenceBackend,

    /// How long a persisted session survives without being written again
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::Memory,
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Persistence backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PersistenceBackend {
    /// Process-local map, lost on restart
    Memory,

    /// One JSON document per session in a directory
    Directory {
        /// Directory holding session documents
        path: PathBuf,
    },
}

impl ColloquyConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `colloquy.toml` in the working directory
    /// 3. The file named by `COLLOQUY_CONFIG_PATH`, if set
    /// 4. `COLLOQUY_*` environment variables (nested keys separated by `__`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid or validation fails.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(ColloquyConfig::default()))
            .merge(Toml::file("colloquy.toml"));

        if let Ok(path) = std::env::var("COLLOQUY_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: ColloquyConfig = figment
            .merge(Env::prefixed("COLLOQUY_").ignore(&["config_path"]).split("__"))
            .extract()
            .map_err(|e| {
                ColloquyError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, layered over defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or validation fails.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: ColloquyConfig = Figment::from(Serialized::defaults(ColloquyConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .extract()
            .map_err(|e| {
                ColloquyError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.session.history_limit == 0 {
            return Err(ColloquyError::Configuration(
                "session.history_limit must be at least 1".to_string(),
            ));
        }
        if self.session.topic_limit == 0 {
            return Err(ColloquyError::Configuration(
                "session.topic_limit must be at least 1".to_string(),
            ));
        }
        if self.session.sweep_interval.is_zero() {
            return Err(ColloquyError::Configuration(
                "session.sweep_interval must be non-zero".to_string(),
            ));
        }
        if self.dependencies.retrieval.top_k == 0 {
            return Err(ColloquyError::Configuration(
                "dependencies.retrieval.top_k must be at least 1".to_string(),
            ));
        }

        for (name, settings) in [
            ("intent", self.dependencies.intent.clone()),
            ("retrieval", self.dependencies.retrieval.service()),
        ] {
            if settings.base_url.trim().is_empty() {
                return Err(ColloquyError::Configuration(format!(
                    "dependencies.{}.base_url must not be empty",
                    name
                )));
            }
            if settings.failure_threshold == 0 {
                return Err(ColloquyError::Configuration(format!(
                    "dependencies.{}.failure_threshold must be at least 1",
                    name
                )));
            }
            if settings.call_timeout.is_zero() {
                return Err(ColloquyError::Configuration(format!(
                    "dependencies.{}.call_timeout must be non-zero",
                    name
                )));
            }
        }

        Ok(())
    }
}
