use std::env;
use std::time::Duration;

const DEFAULT_WORKERS: usize = 2;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 40;
const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;
const DEFAULT_RATE_LIMIT_MAX_CONCURRENT: u32 = 8;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_RETRY_MAX_BACKUP_ATTEMPTS: u32 = 1;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Rate-limit parameters. The pool itself does not enforce them; they are
/// handed to the executor, which throttles its provider calls.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
    pub max_concurrent: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_RATE_LIMIT_MAX_REQUESTS,
            window_ms: DEFAULT_RATE_LIMIT_WINDOW_MS,
            max_concurrent: DEFAULT_RATE_LIMIT_MAX_CONCURRENT,
        }
    }
}

/// Retry/backoff policy. Executed entirely inside the execution context;
/// the pool only carries the configuration surface.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub use_backup_provider: bool,
    pub max_backup_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            use_backup_provider: true,
            max_backup_attempts: DEFAULT_RETRY_MAX_BACKUP_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of execution contexts. Minimum 1; all are spawned eagerly.
    pub num_workers: usize,
    pub request_timeout_ms: u64,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub debug: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_WORKERS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            debug: false,
        }
    }
}

impl PoolConfig {
    /// Build a config from environment variables, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        Self {
            num_workers: env_parse("PLUME_POOL_WORKERS", DEFAULT_WORKERS).max(1),
            request_timeout_ms: env_parse(
                "PLUME_POOL_REQUEST_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            ),
            rate_limit: RateLimitConfig {
                max_requests: env_parse(
                    "PLUME_POOL_RATE_LIMIT_MAX_REQUESTS",
                    DEFAULT_RATE_LIMIT_MAX_REQUESTS,
                ),
                window_ms: env_parse(
                    "PLUME_POOL_RATE_LIMIT_WINDOW_MS",
                    DEFAULT_RATE_LIMIT_WINDOW_MS,
                ),
                max_concurrent: env_parse(
                    "PLUME_POOL_RATE_LIMIT_MAX_CONCURRENT",
                    DEFAULT_RATE_LIMIT_MAX_CONCURRENT,
                ),
            },
            retry: RetryConfig {
                max_attempts: env_parse("PLUME_POOL_RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS),
                base_delay_ms: env_parse(
                    "PLUME_POOL_RETRY_BASE_DELAY_MS",
                    DEFAULT_RETRY_BASE_DELAY_MS,
                ),
                max_delay_ms: env_parse(
                    "PLUME_POOL_RETRY_MAX_DELAY_MS",
                    DEFAULT_RETRY_MAX_DELAY_MS,
                ),
                use_backup_provider: env::var("PLUME_POOL_RETRY_USE_BACKUP_PROVIDER")
                    .map(|v| v != "false" && v != "0")
                    .unwrap_or(true),
                max_backup_attempts: env_parse(
                    "PLUME_POOL_RETRY_MAX_BACKUP_ATTEMPTS",
                    DEFAULT_RETRY_MAX_BACKUP_ATTEMPTS,
                ),
            },
            debug: env::var("PLUME_POOL_DEBUG")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
