use std::env;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://avs-alexa-na.amazon.com";
pub const API_VERSION: &str = "v20160207";

/// Upper bound for every configured duration: one day
pub const MAX_DURATION_SECS: u64 = 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("Unsupported endpoint scheme '{0}', expected http or https")]
    UnsupportedScheme(String),
}

/// Endpoints and timing for talking to AVS
#[derive(Debug, Clone)]
pub struct AvsConfig {
    /// Scheme and host, without a trailing slash
    pub endpoint: String,
    pub api_version: String,
    pub request_timeout: Duration,
    /// The downchannel is expected to stay up for an hour at a time
    pub downchannel_timeout: Duration,
    pub ping_interval: Duration,
}

impl Default for AvsConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_version: API_VERSION.to_string(),
            request_timeout: Duration::from_secs(30),
            downchannel_timeout: Duration::from_secs(3600),
            ping_interval: Duration::from_secs(300),
        }
    }
}

impl AvsConfig {
    /// Point the client at a different host, e.g. a regional endpoint or a test server
    pub fn with_endpoint(endpoint: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(endpoint)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
        }

        Ok(Self {
            endpoint: url.as_str().trim_end_matches('/').to_string(),
            ..Self::default()
        })
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let mut config = match env::var("AVS_ENDPOINT") {
            Ok(endpoint) => Self::with_endpoint(&endpoint)?,
            Err(_) => Self::default(),
        };

        if let Some(secs) = Self::load_secs("AVS_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = Self::load_secs("AVS_DOWNCHANNEL_TIMEOUT_SECS")? {
            config.downchannel_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = Self::load_secs("AVS_PING_INTERVAL_SECS")? {
            config.ping_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }

    fn load_secs(var: &str) -> Result<Option<u64>, ConfigError> {
        match env::var(var) {
            Ok(raw) => Self::parse_secs(var, &raw).map(Some),
            Err(_) => Ok(None),
        }
    }

    fn parse_secs(var: &str, raw: &str) -> Result<u64, ConfigError> {
        let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            reason: format!("'{}' is not a whole number of seconds", raw),
        })?;
        Self::check_duration(var, Duration::from_secs(secs))?;
        Ok(secs)
    }

    /// Reject timings the client cannot schedule. Fields are public, so this
    /// runs again when a client is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::check_duration("request_timeout", self.request_timeout)?;
        Self::check_duration("downchannel_timeout", self.downchannel_timeout)?;
        Self::check_duration("ping_interval", self.ping_interval)
    }

    fn check_duration(var: &str, value: Duration) -> Result<(), ConfigError> {
        if value.is_zero() {
            return Err(ConfigError::InvalidValue {
                var: var.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if value > Duration::from_secs(MAX_DURATION_SECS) {
            return Err(ConfigError::InvalidValue {
                var: var.to_string(),
                reason: format!("must be at most {} seconds", MAX_DURATION_SECS),
            });
        }
        Ok(())
    }

    pub fn ping_url(&self) -> String {
        self.join("ping")
    }

    pub fn directives_url(&self) -> String {
        self.join(&format!("{}/directives", self.api_version))
    }

    pub fn events_url(&self) -> String {
        self.join(&format!("{}/events", self.api_version))
    }

    fn join(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_urls() {
        let config = AvsConfig::default();
        assert_eq!(config.ping_url(), "https://avs-alexa-na.amazon.com/ping");
        assert_eq!(
            config.directives_url(),
            "https://avs-alexa-na.amazon.com/v20160207/directives"
        );
        assert_eq!(
            config.events_url(),
            "https://avs-alexa-na.amazon.com/v20160207/events"
        );
        assert_eq!(config.downchannel_timeout, Duration::from_secs(3600));
        assert_eq!(config.ping_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_custom_endpoint_with_trailing_slash() {
        let config = AvsConfig::with_endpoint("http://127.0.0.1:8080/").unwrap();
        assert_eq!(config.ping_url(), "http://127.0.0.1:8080/ping");
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(AvsConfig::with_endpoint("not a url").is_err());
        assert!(matches!(
            AvsConfig::with_endpoint("ftp://example.com"),
            Err(ConfigError::UnsupportedScheme(scheme)) if scheme == "ftp"
        ));
    }

    const VARS: [&str; 4] = [
        "AVS_ENDPOINT",
        "AVS_REQUEST_TIMEOUT_SECS",
        "AVS_DOWNCHANNEL_TIMEOUT_SECS",
        "AVS_PING_INTERVAL_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        env::set_var("AVS_ENDPOINT", "https://avs-alexa-eu.amazon.com");
        env::set_var("AVS_PING_INTERVAL_SECS", " 60 ");

        let config = AvsConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.ping_url(), "https://avs-alexa-eu.amazon.com/ping");
        assert_eq!(config.ping_interval, Duration::from_secs(60));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_timeout() {
        clear_env();
        env::set_var("AVS_REQUEST_TIMEOUT_SECS", "0");

        let result = AvsConfig::from_env();
        clear_env();

        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref var, .. }) if var == "AVS_REQUEST_TIMEOUT_SECS"
        ));
    }

    #[test]
    fn test_seconds_validation() {
        assert_eq!(AvsConfig::parse_secs("X", "42").unwrap(), 42);
        assert!(AvsConfig::parse_secs("X", "0").is_err());
        assert!(AvsConfig::parse_secs("X", "soon").is_err());
        assert_eq!(AvsConfig::parse_secs("X", "86400").unwrap(), MAX_DURATION_SECS);
        assert!(AvsConfig::parse_secs("X", "86401").is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_huge_ping_interval() {
        clear_env();
        env::set_var("AVS_PING_INTERVAL_SECS", u64::MAX.to_string());

        let result = AvsConfig::from_env();
        clear_env();

        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref var, .. }) if var == "AVS_PING_INTERVAL_SECS"
        ));
    }

    #[test]
    fn test_validate_catches_fields_set_directly() {
        assert!(AvsConfig::default().validate().is_ok());

        let mut config = AvsConfig::default();
        config.ping_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = AvsConfig::default();
        config.ping_interval = Duration::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref var, .. }) if var == "ping_interval"
        ));
    }
}
