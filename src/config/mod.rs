use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReactorConfig {
    /// Upper bound on how long one readiness poll may block.
    pub poll_timeout_ms: u64,
    /// Bytes requested from the transport per read.
    pub read_budget: usize,
    /// Largest payload a peer may announce in one frame.
    pub max_frame_size: u64,
    /// Close and drop a misbehaving peer instead of failing the whole loop.
    pub isolate_failures: bool,
    /// Reject client frames that arrive without a mask.
    pub require_masked_frames: bool,
    pub max_connections: usize,
}

impl ReactorConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 10,
            read_budget: 1024,
            max_frame_size: 16 * 1024 * 1024,
            isolate_failures: true,
            require_masked_frames: true,
            max_connections: 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub reactor: ReactorConfig,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Self::with_defaults(Config::builder(), "development")?
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // E.g., `APP_SERVER__PORT=5001` would set `Settings.server.port`
            .add_source(
                Environment::with_prefix("app")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        s.try_deserialize::<Settings>()?.validated()
    }

    pub fn new_for_test() -> Result<Self, ConfigError> {
        Self::with_defaults(Config::builder(), "test")?
            .set_override("server.host", "127.0.0.1")?
            .set_override("server.port", 0)?
            .build()?
            .try_deserialize::<Settings>()?
            .validated()
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        environment: &str,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let server = ServerConfig::default();
        let reactor = ReactorConfig::default();

        builder
            .set_default("environment", environment)?
            .set_default("server.host", server.host)?
            .set_default("server.port", server.port as i64)?
            .set_default("reactor.poll_timeout_ms", reactor.poll_timeout_ms as i64)?
            .set_default("reactor.read_budget", reactor.read_budget as i64)?
            .set_default("reactor.max_frame_size", reactor.max_frame_size as i64)?
            .set_default("reactor.isolate_failures", reactor.isolate_failures)?
            .set_default("reactor.require_masked_frames", reactor.require_masked_frames)?
            .set_default("reactor.max_connections", reactor.max_connections as i64)
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.reactor.read_budget == 0 {
            return Err(ConfigError::Message("reactor.read_budget must be greater than zero".into()));
        }
        if self.reactor.max_frame_size == 0 {
            return Err(ConfigError::Message("reactor.max_frame_size must be greater than zero".into()));
        }
        if self.reactor.max_connections == 0 {
            return Err(ConfigError::Message("reactor.max_connections must be greater than zero".into()));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn cleanup_env() {
        env::remove_var("APP_SERVER__PORT");
        env::remove_var("APP_SERVER__HOST");
        env::remove_var("APP_REACTOR__READ_BUDGET");
        env::remove_var("APP_REACTOR__MAX_FRAME_SIZE");
        env::remove_var("APP_REACTOR__ISOLATE_FAILURES");
    }

    #[test]
    fn test_settings_defaults() {
        cleanup_env();
        let settings = Settings::new_for_test().expect("Failed to load settings");
        assert_eq!(settings.environment, "test");
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.reactor.read_budget, 1024);
        assert_eq!(settings.reactor.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(settings.reactor.poll_timeout(), Duration::from_millis(10));
        assert!(settings.reactor.isolate_failures);
        assert!(settings.reactor.require_masked_frames);
    }

    #[test]
    fn test_server_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "localhost");
        assert_eq!(server.port, 4000);
    }

    #[test]
    fn test_environment_override() {
        cleanup_env();
        env::set_var("APP_SERVER__PORT", "9000");
        env::set_var("APP_REACTOR__ISOLATE_FAILURES", "false");

        let config = Settings::with_defaults(Config::builder(), "test")
            .unwrap()
            // Add environment variables last to override defaults
            .add_source(
                Environment::with_prefix("app")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()
            .expect("Failed to build config")
            .try_deserialize::<Settings>()
            .expect("Failed to deserialize settings");

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "localhost");
        assert!(!config.reactor.isolate_failures);

        cleanup_env();
    }

    #[test]
    fn test_zero_read_budget_rejected() {
        let result = Settings::with_defaults(Config::builder(), "test")
            .unwrap()
            .set_override("reactor.read_budget", 0)
            .unwrap()
            .build()
            .and_then(|config| config.try_deserialize::<Settings>())
            .and_then(Settings::validated);

        let err = result.expect_err("Expected error for zero read budget");
        assert!(err.to_string().contains("read_budget"), "Unexpected error: {}", err);
    }

    #[test]
    fn test_zero_max_frame_size_rejected() {
        let result = Settings::with_defaults(Config::builder(), "test")
            .unwrap()
            .set_override("reactor.max_frame_size", 0)
            .unwrap()
            .build()
            .and_then(|config| config.try_deserialize::<Settings>())
            .and_then(Settings::validated);

        let err = result.expect_err("Expected error for zero frame size limit");
        assert!(err.to_string().contains("max_frame_size"), "Unexpected error: {}", err);
    }
}
