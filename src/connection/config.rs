use crate::core::{AccessMode, DriverError, Result, ServerAddress};
use serde::Deserialize;
use std::time::Duration;

/// Driver configuration
///
/// Options recognised by the pool, the sessions and the transaction runner.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Database used by sessions that do not name one
    pub database: String,

    /// Access mode used by sessions that do not set one
    pub default_access_mode: AccessMode,

    /// Maximum number of connections per server address
    pub max_connection_pool_size: usize,

    /// How long `acquire` waits for a free connection
    pub connection_acquisition_timeout: Duration,

    /// Retry budget for transaction functions
    pub max_transaction_retry_time: Duration,

    /// Optional cap on attempts, on top of the time budget
    pub max_retry_attempts: Option<usize>,

    /// Delay before the first retry
    pub initial_retry_delay: Duration,

    /// Growth factor applied to the delay after each retry
    pub retry_delay_multiplier: f64,

    /// Fraction of each delay randomised in either direction
    pub retry_jitter_factor: f64,

    /// Upper bound for a single retry delay
    pub max_retry_delay: Duration,

    /// Idle connections older than this are closed instead of reused
    pub idle_timeout: Option<Duration>,

    /// Connections older than this are closed instead of reused
    pub max_connection_lifetime: Option<Duration>,

    /// Seed server from a connection URL, if any
    pub seed_address: Option<ServerAddress>,
}

impl DriverConfig {
    /// Create a configuration targeting `database` with default settings
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            default_access_mode: AccessMode::Write,
            max_connection_pool_size: 100,
            connection_acquisition_timeout: Duration::from_secs(60),
            max_transaction_retry_time: Duration::from_secs(30),
            max_retry_attempts: None,
            initial_retry_delay: Duration::from_secs(1),
            retry_delay_multiplier: 2.0,
            retry_jitter_factor: 0.2,
            max_retry_delay: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
            max_connection_lifetime: Some(Duration::from_secs(3600)), // 1 hour
            seed_address: None,
        }
    }

    pub fn database(mut self, database: &str) -> Self {
        self.database = database.to_string();
        self
    }

    pub fn default_access_mode(mut self, mode: AccessMode) -> Self {
        self.default_access_mode = mode;
        self
    }

    pub fn max_connection_pool_size(mut self, max: usize) -> Self {
        self.max_connection_pool_size = max;
        self
    }

    pub fn connection_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.connection_acquisition_timeout = timeout;
        self
    }

    pub fn max_transaction_retry_time(mut self, budget: Duration) -> Self {
        self.max_transaction_retry_time = budget;
        self
    }

    pub fn max_retry_attempts(mut self, attempts: usize) -> Self {
        self.max_retry_attempts = Some(attempts);
        self
    }

    pub fn initial_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = delay;
        self
    }

    pub fn retry_delay_multiplier(mut self, multiplier: f64) -> Self {
        self.retry_delay_multiplier = multiplier;
        self
    }

    pub fn retry_jitter_factor(mut self, factor: f64) -> Self {
        self.retry_jitter_factor = factor;
        self
    }

    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn max_connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_connection_lifetime = Some(lifetime);
        self
    }

    pub fn seed_address(mut self, address: ServerAddress) -> Self {
        self.seed_address = Some(address);
        self
    }

    /// Parse from connection string
    ///
    /// Format: `causaldb://host[:port][/database][?option=value&...]`
    ///
    /// Recognised options: `max_pool_size`, `acquisition_timeout_ms`,
    /// `max_retry_time_ms`, `access_mode`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use causaldb::DriverConfig;
    /// let config = DriverConfig::from_url(
    ///     "causaldb://db.example.com:7687/orders?max_pool_size=20"
    /// ).unwrap();
    /// assert_eq!(config.database, "orders");
    /// assert_eq!(config.max_connection_pool_size, 20);
    /// ```
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url.strip_prefix("causaldb://").ok_or_else(|| {
            DriverError::Configuration("URL must start with 'causaldb://'".to_string())
        })?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let (host_port, database) = match location.split_once('/') {
            Some((host_port, database)) if !database.is_empty() => (host_port, database),
            Some((host_port, _)) => (host_port, DEFAULT_DATABASE),
            None => (location, DEFAULT_DATABASE),
        };

        let mut config = Self::new(database);
        config.seed_address = Some(host_port.parse()?);

        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                DriverError::Configuration(format!("malformed URL option '{pair}'"))
            })?;
            match key {
                "max_pool_size" => config.max_connection_pool_size = parse_number(key, value)?,
                "acquisition_timeout_ms" => {
                    config.connection_acquisition_timeout =
                        Duration::from_millis(parse_number(key, value)?)
                }
                "max_retry_time_ms" => {
                    config.max_transaction_retry_time =
                        Duration::from_millis(parse_number(key, value)?)
                }
                "access_mode" => config.default_access_mode = value.parse()?,
                other => {
                    return Err(DriverError::Configuration(format!(
                        "unknown URL option '{other}'"
                    )));
                }
            }
        }

        Ok(config)
    }

    /// Load options from a JSON document.
    ///
    /// Every key is optional; durations are given in milliseconds.
    ///
    /// ```
    /// # use causaldb::DriverConfig;
    /// let config = DriverConfig::from_json(
    ///     r#"{ "database": "foo", "max_connection_pool_size": 4, "max_transaction_retry_time_ms": 500 }"#
    /// ).unwrap();
    /// assert_eq!(config.max_connection_pool_size, 4);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let file: DriverConfigFile = serde_json::from_str(json)
            .map_err(|e| DriverError::Configuration(format!("invalid config JSON: {e}")))?;
        let config = file.into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to connection string
    pub fn to_url(&self) -> String {
        let seed = self
            .seed_address
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "localhost".to_string());
        format!(
            "causaldb://{}/{}?max_pool_size={}",
            seed, self.database, self.max_connection_pool_size
        )
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.trim().is_empty() {
            return Err(DriverError::Configuration(
                "database cannot be empty".to_string(),
            ));
        }

        if self.max_connection_pool_size == 0 {
            return Err(DriverError::Configuration(
                "max_connection_pool_size must be > 0".to_string(),
            ));
        }

        if self.max_retry_attempts == Some(0) {
            return Err(DriverError::Configuration(
                "max_retry_attempts must be > 0".to_string(),
            ));
        }

        if !(self.retry_delay_multiplier >= 1.0) {
            return Err(DriverError::Configuration(
                "retry_delay_multiplier must be >= 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            return Err(DriverError::Configuration(
                "retry_jitter_factor must be within 0.0..=1.0".to_string(),
            ));
        }

        Ok(())
    }
}

const DEFAULT_DATABASE: &str = "default";

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATABASE)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| DriverError::Configuration(format!("option '{key}' expects a number, got '{value}'")))
}

/// On-disk/JSON shape of [`DriverConfig`].
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DriverConfigFile {
    database: Option<String>,
    default_access_mode: Option<AccessMode>,
    max_connection_pool_size: Option<usize>,
    connection_acquisition_timeout_ms: Option<u64>,
    max_transaction_retry_time_ms: Option<u64>,
    max_retry_attempts: Option<usize>,
    initial_retry_delay_ms: Option<u64>,
    retry_delay_multiplier: Option<f64>,
    retry_jitter_factor: Option<f64>,
    max_retry_delay_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
    max_connection_lifetime_ms: Option<u64>,
    seed_address: Option<String>,
}

impl DriverConfigFile {
    fn into_config(self) -> Result<DriverConfig> {
        let mut config = DriverConfig::default();
        if let Some(database) = self.database {
            config.database = database;
        }
        if let Some(mode) = self.default_access_mode {
            config.default_access_mode = mode;
        }
        if let Some(max) = self.max_connection_pool_size {
            config.max_connection_pool_size = max;
        }
        if let Some(ms) = self.connection_acquisition_timeout_ms {
            config.connection_acquisition_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_transaction_retry_time_ms {
            config.max_transaction_retry_time = Duration::from_millis(ms);
        }
        if self.max_retry_attempts.is_some() {
            config.max_retry_attempts = self.max_retry_attempts;
        }
        if let Some(ms) = self.initial_retry_delay_ms {
            config.initial_retry_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = self.retry_delay_multiplier {
            config.retry_delay_multiplier = multiplier;
        }
        if let Some(factor) = self.retry_jitter_factor {
            config.retry_jitter_factor = factor;
        }
        if let Some(ms) = self.max_retry_delay_ms {
            config.max_retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.idle_timeout_ms {
            config.idle_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = self.max_connection_lifetime_ms {
            config.max_connection_lifetime = Some(Duration::from_millis(ms));
        }
        if let Some(seed) = self.seed_address {
            config.seed_address = Some(seed.parse()?);
        }
        Ok(config)
    }
}
