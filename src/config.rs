use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.hostaway.com";
pub const DEFAULT_PROVIDER: &str = "hostaway";

/// Everything the sync pipeline needs from its environment, injected at
/// construction instead of being read ad hoc.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Provider key used for the token cache and the integration health row.
    pub provider: String,
    /// Service name recorded on sync runs; the cooldown gate is scoped to it.
    pub service: String,
    pub page_size: u32,
    pub max_concurrency: usize,
    pub request_timeout: Duration,
    pub listing_timeout: Duration,
    pub run_timeout: Duration,
    pub listings_retry_delay: Duration,
    pub booking_write_delay: Duration,
    pub token_refresh_margin: Duration,
    pub cooldown: CooldownPolicy,
}

/// Spacing and backoff rules applied by the cooldown gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    /// Minimum spacing between successful runs.
    pub min_interval_minutes: i64,
    pub backoff_base_minutes: i64,
    pub backoff_cap_minutes: i64,
    /// In-progress runs older than this are treated as abandoned.
    pub stale_run_minutes: i64,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            min_interval_minutes: 15,
            backoff_base_minutes: 15,
            backoff_cap_minutes: 240,
            stale_run_minutes: 60,
        }
    }
}

impl CooldownPolicy {
    /// `min(base * 2^retry_count, cap)` minutes.
    pub fn backoff_minutes(&self, retry_count: u32) -> i64 {
        let factor = 1i64.checked_shl(retry_count.min(32)).unwrap_or(i64::MAX);
        self.backoff_base_minutes
            .saturating_mul(factor)
            .min(self.backoff_cap_minutes)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            client_id: None,
            client_secret: None,
            provider: DEFAULT_PROVIDER.to_string(),
            service: DEFAULT_PROVIDER.to_string(),
            page_size: 100,
            max_concurrency: 8,
            request_timeout: Duration::from_secs(30),
            listing_timeout: Duration::from_secs(120),
            run_timeout: Duration::from_secs(15 * 60),
            listings_retry_delay: Duration::from_secs(5),
            booking_write_delay: Duration::from_millis(50),
            token_refresh_margin: Duration::from_secs(60),
            cooldown: CooldownPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Load config from `RENTALSYNC_*` environment variables, falling back to
    /// defaults. Credentials stay `None` when unset; the token provider
    /// reports that as a configuration error at sync time.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Some(url) = env_string("RENTALSYNC_API_URL") {
            config.api_base_url = url;
        }
        config.client_id = env_string("RENTALSYNC_CLIENT_ID");
        config.client_secret = env_string("RENTALSYNC_CLIENT_SECRET");
        if let Some(provider) = env_string("RENTALSYNC_PROVIDER") {
            config.service = provider.clone();
            config.provider = provider;
        }
        if let Some(v) = env_parse::<u32>("RENTALSYNC_PAGE_SIZE")? {
            if v == 0 {
                return Err("RENTALSYNC_PAGE_SIZE must be greater than zero".into());
            }
            config.page_size = v;
        }
        if let Some(v) = env_parse::<usize>("RENTALSYNC_MAX_CONCURRENCY")? {
            config.max_concurrency = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("RENTALSYNC_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("RENTALSYNC_RUN_TIMEOUT_SECS")? {
            config.run_timeout = Duration::from_secs(v);
        }

        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.api_base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_credentials(mut self, client_id: &str, client_secret: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self.client_secret = Some(client_secret.to_string());
        self
    }

    /// Config with all sleeps zeroed, for tests against a mock server.
    #[cfg(test)]
    pub fn for_tests(base_url: &str) -> Self {
        Self {
            listings_retry_delay: Duration::ZERO,
            booking_write_delay: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
            ..Self::default()
        }
        .with_base_url(base_url)
        .with_credentials("test-client", "test-secret")
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, String> {
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| format!("{key} has an invalid value: {raw}")),
    }
}
