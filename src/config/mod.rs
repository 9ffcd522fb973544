use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub dry_run: bool,
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub database: DatabaseConfig,
    pub graph: GraphConfig,
    pub vector: VectorConfig,
    pub session: SessionConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

/// OpenAI-compatible LLM configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// `None` runs the generator in heuristic (degraded) mode.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
}

/// Relational database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Neo4j configuration
#[derive(Debug, Clone, Default)]
pub struct GraphConfig {
    pub uri: Option<String>,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Pinecone configuration
#[derive(Debug, Clone, Default)]
pub struct VectorConfig {
    pub enabled: bool,
    pub host: Option<String>,
    pub api_key: Option<String>,
    pub top_k: usize,
}

/// Conversation session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub timeout_secs: u64,
    pub redis_url: Option<String>,
    pub redis_expire_secs: u64,
    pub history_limit: usize,
    /// bcrypt cost for registration passwords.
    pub password_hash_cost: u32,
}

/// Response cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Outbound HTTP request and retry configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let dry_run = env_bool("CAVA_DRY_RUN_MODE", true);

        let bind = env::var("AVA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let server = ServerConfig {
            bind_addr: SocketAddr::from_str(&bind).map_err(|e| AppError::Config {
                message: format!("AVA_BIND_ADDR is not a socket address ({}): {}", bind, e),
            })?,
        };

        let llm = LlmConfig {
            api_key: env_opt("OPENAI_API_KEY"),
            base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model: env::var("CAVA_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            embedding_model: env::var("CAVA_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env_opt("DATABASE_PATH")
                    .or_else(|| env_opt("DATABASE_URL").map(|url| sqlite_path_from_url(&url)))
                    .unwrap_or_else(|| "./data/ava_olo.db".to_string()),
            ),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5),
        };

        let graph = GraphConfig {
            uri: env_opt("CAVA_NEO4J_URI"),
            user: env::var("CAVA_NEO4J_USER").unwrap_or_else(|_| "neo4j".to_string()),
            password: env::var("CAVA_NEO4J_PASSWORD").unwrap_or_default(),
            database: env::var("CAVA_NEO4J_DATABASE").unwrap_or_else(|_| "neo4j".to_string()),
        };

        let vector = VectorConfig {
            enabled: env_bool("CAVA_ENABLE_VECTOR", false),
            host: env_opt("CAVA_PINECONE_HOST"),
            api_key: env_opt("PINECONE_API_KEY"),
            top_k: env_parse("CAVA_VECTOR_TOP_K", 3),
        };

        let session = SessionConfig {
            timeout_secs: env_parse("CAVA_SESSION_TIMEOUT", 3600),
            redis_url: env_opt("CAVA_REDIS_URL"),
            redis_expire_secs: env_parse("CAVA_REDIS_EXPIRE_SECONDS", 3600),
            history_limit: env_parse("CAVA_HISTORY_LIMIT", 50),
            password_hash_cost: env_parse("CAVA_PASSWORD_HASH_COST", bcrypt::DEFAULT_COST),
        };

        let cache = CacheConfig {
            ttl_secs: env_parse("CAVA_CACHE_TTL_SECONDS", 300),
            max_entries: env_parse("CAVA_CACHE_MAX_ENTRIES", 1000),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: env_parse("REQUEST_TIMEOUT_MS", 30000),
            max_retries: env_parse("MAX_RETRIES", 2),
            retry_delay_ms: env_parse("RETRY_DELAY_MS", 500),
        };

        let config = Config {
            dry_run,
            server,
            llm,
            database,
            graph,
            vector,
            session,
            cache,
            logging,
            request,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work outside dry-run mode.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.dry_run {
            return Ok(());
        }
        if self.vector.enabled && self.vector.host.is_none() {
            return Err(AppError::Config {
                message: "CAVA_ENABLE_VECTOR requires CAVA_PINECONE_HOST".to_string(),
            });
        }
        if self.vector.enabled && self.llm.api_key.is_none() {
            return Err(AppError::Config {
                message: "CAVA_ENABLE_VECTOR requires OPENAI_API_KEY for embeddings".to_string(),
            });
        }
        if !(4..=31).contains(&self.session.password_hash_cost) {
            return Err(AppError::Config {
                message: "CAVA_PASSWORD_HASH_COST must be between 4 and 31".to_string(),
            });
        }
        if self.session.history_limit == 0 {
            return Err(AppError::Config {
                message: "CAVA_HISTORY_LIMIT must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Configuration suited to tests: dry-run, in-memory database, no LLM.
    pub fn for_tests() -> Self {
        Self {
            dry_run: true,
            server: ServerConfig {
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            },
            llm: LlmConfig {
                api_key: None,
                base_url: "http://127.0.0.1:9".to_string(),
                model: "gpt-4o-mini".to_string(),
                embedding_model: "text-embedding-3-small".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from(":memory:"),
                max_connections: 1,
            },
            graph: GraphConfig::default(),
            vector: VectorConfig::default(),
            session: SessionConfig {
                password_hash_cost: 4,
                ..SessionConfig::default()
            },
            cache: CacheConfig::default(),
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: LogFormat::Pretty,
            },
            request: RequestConfig {
                timeout_ms: 2000,
                max_retries: 0,
                retry_delay_ms: 10,
            },
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            redis_url: None,
            redis_expire_secs: 3600,
            history_limit: 50,
            password_hash_cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 1000,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

/// Connection variables for a server database. Storage is SQLite, so these
/// only ever mean a stale deployment environment.
const SERVER_DATABASE_VARS: &[&str] = &["DB_HOST", "DB_PORT", "DB_NAME", "DB_USER", "DB_PASSWORD"];

/// Database variables that are set but have no effect; storage only reads
/// `DATABASE_PATH` / `DATABASE_URL`.
pub fn ignored_database_vars() -> Vec<&'static str> {
    SERVER_DATABASE_VARS
        .iter()
        .copied()
        .filter(|key| env_opt(key).is_some())
        .collect()
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `sqlite://path/to.db?mode=rwc` -> `path/to.db`
fn sqlite_path_from_url(url: &str) -> String {
    let stripped = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    stripped.split('?').next().unwrap_or(stripped).to_string()
}
