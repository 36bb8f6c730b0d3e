use crate::auth::jwt::JwtConfig;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    pub request_timeout_secs: u64,
    pub jwt: JwtConfig,
    /// Shared secret workers send in `x-worker-token`.
    pub worker_token: String,
    /// PostgreSQL URL. `None` runs on the in-memory store.
    pub database_url: Option<String>,
    /// Coverage endpoint. `None` serves an empty static coverage.
    pub coverage_url: Option<String>,
    pub coverage_refresh_secs: u64,
    pub dispatch_queue_capacity: usize,
    pub secs_per_image_step: f64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default                       |
    /// |---------------------------|-------------------------------|
    /// | `HOST`                    | `0.0.0.0`                     |
    /// | `PORT`                    | `3000`                        |
    /// | `CORS_ORIGINS`            | `http://localhost:5173`       |
    /// | `REQUEST_TIMEOUT_SECS`    | `30`                          |
    /// | `DATABASE_URL`            | unset (in-memory store)       |
    /// | `JWT_SECRET`              | **required**                  |
    /// | `WORKER_TOKEN`            | **required**                  |
    /// | `COVERAGE_URL`            | unset (empty static coverage) |
    /// | `COVERAGE_REFRESH_SECS`   | `30`                          |
    /// | `DISPATCH_QUEUE_CAPACITY` | `1000`                        |
    /// | `SECS_PER_IMAGE_STEP`     | `0.15`                        |
    ///
    /// # Panics
    ///
    /// Panics on a missing required variable or an unparsable value, so
    /// misconfiguration fails at startup.
    pub fn from_env() -> Self {
        let host = env_or("HOST", "0.0.0.0");

        let port: u16 = env_or("PORT", "3000")
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = env_or("CORS_ORIGINS", "http://localhost:5173")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = env_or("REQUEST_TIMEOUT_SECS", "30")
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let worker_token =
            std::env::var("WORKER_TOKEN").expect("WORKER_TOKEN must be set in the environment");
        assert!(!worker_token.is_empty(), "WORKER_TOKEN must not be empty");

        let coverage_refresh_secs: u64 = env_or("COVERAGE_REFRESH_SECS", "30")
            .parse()
            .expect("COVERAGE_REFRESH_SECS must be a valid u64");
        assert!(coverage_refresh_secs > 0, "COVERAGE_REFRESH_SECS must be positive");

        let dispatch_queue_capacity: usize = env_or("DISPATCH_QUEUE_CAPACITY", "1000")
            .parse()
            .expect("DISPATCH_QUEUE_CAPACITY must be a valid usize");

        let secs_per_image_step: f64 = env_or("SECS_PER_IMAGE_STEP", "0.15")
            .parse()
            .expect("SECS_PER_IMAGE_STEP must be a number");

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            jwt: JwtConfig::from_env(),
            worker_token,
            database_url: optional_env("DATABASE_URL"),
            coverage_url: optional_env("COVERAGE_URL"),
            coverage_refresh_secs,
            dispatch_queue_capacity,
            secs_per_image_step,
        }
    }
}
