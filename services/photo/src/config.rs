use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the dealer photo service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Record store configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Dealer registry configuration
    pub dealers: DealersConfig,
    /// Background removal provider configuration
    #[serde(default)]
    pub remover: RemoverConfig,
    /// Job polling configuration
    #[serde(default)]
    pub polling: PollingConfig,
    /// Local model configuration
    #[serde(default)]
    pub local_processor: LocalProcessorConfig,
    /// Upload validation limits
    #[serde(default)]
    pub upload: UploadConfig,
    /// Operator session lifetime
    #[serde(default)]
    pub sessions: SessionConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for image storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public base URL objects are served from (CDN or bucket website).
    /// Falls back to the virtual-hosted S3 URL when unset.
    pub public_base_url: Option<String>,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Record store backend selection
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordBackend {
    #[default]
    Postgres,
    Memory,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Which record store implementation to use
    #[serde(default)]
    pub backend: RecordBackend,
    /// PostgreSQL connection URL
    #[serde(default)]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Dealer registry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DealersConfig {
    /// `http(s)://` URL or local path of the dealers JSON document
    pub source: String,
    /// Cache freshness window in seconds
    #[serde(default = "default_dealer_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Timeout for fetching the registry over HTTP
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Background removal provider configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RemoverConfig {
    /// Provider API base URL
    #[serde(default = "default_remover_base_url")]
    pub base_url: String,
    /// Provider API key
    pub api_key: Option<String>,
    /// Background requested from the provider
    #[serde(default = "default_background")]
    pub background: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Job polling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    /// Maximum number of status checks per job
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between status checks in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
}

/// Local background removal model configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LocalProcessorConfig {
    /// Program to run; the passthrough stub is used when unset
    pub program: Option<String>,
    /// Arguments placed before the input and output paths
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for temporary files (system temp dir when unset)
    pub work_dir: Option<PathBuf>,
}

/// Upload validation limits
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Maximum accepted image size in bytes (10MB default)
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
}

/// Operator session lifetime
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Untouched sessions older than this are dropped
    #[serde(default = "default_session_idle_secs")]
    pub idle_timeout_secs: u64,
    /// How often idle sessions are swept
    #[serde(default = "default_session_sweep_secs")]
    pub sweep_interval_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "dealer-photo-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_dealer_cache_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_remover_base_url() -> String {
    "https://api.lightxeditor.com/external/api/v1".to_string()
}

fn default_background() -> String {
    "transparent".to_string()
}

fn default_max_attempts() -> u32 {
    30
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_max_image_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_session_idle_secs() -> u64 {
    30 * 60
}

fn default_session_sweep_secs() -> u64 {
    60
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "dealer-photo-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/photo").required(false))
            .add_source(config::File::with_name("/etc/dealer-photo/photo").required(false))
            // Override with environment variables
            // PHOTO__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("PHOTO")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get dealer cache freshness window as Duration
    pub fn dealer_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.dealers.cache_ttl_secs)
    }
}

impl DatabaseConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl PollingConfig {
    /// Delay between two status checks
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl RemoverConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: RecordBackend::default(),
            url: String::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: default_true(),
        }
    }
}

impl Default for RemoverConfig {
    fn default() -> Self {
        Self {
            base_url: default_remover_base_url(),
            api_key: None,
            background: default_background(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: default_max_image_bytes(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_session_idle_secs(),
            sweep_interval_secs: default_session_sweep_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}
