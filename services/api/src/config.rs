use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use chorus_core::{BusConfig, OrchestratorConfig, RetryPolicy, SequencerConfig};
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub openai_api_key: String,
    pub llm_api_base: String,
    pub chat_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub speech_enabled: bool,
    pub log_level: Level,
    pub ring_buffer_size: usize,
    pub agent_deadline: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub gap_timeout: Duration,
    pub playback_ack_timeout: Duration,
    pub chain_routing: bool,
    pub player_sample_rate: u32,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var_or(key, default);
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(key.to_string(), format!("'{raw}': {e}")))
}

fn parse_millis(key: &str, default: &str) -> Result<Duration, ConfigError> {
    parse_var::<u64>(key, default).map(Duration::from_millis)
}

fn parse_flag(key: &str, default: &str) -> Result<bool, ConfigError> {
    let raw = var_or(key, default);
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue(
            key.to_string(),
            format!("'{raw}' is not a boolean"),
        )),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parse_var::<SocketAddr>("BIND_ADDRESS", "0.0.0.0:3000")?;

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let ring_buffer_size = parse_var::<usize>("RING_BUFFER_SIZE", "100")?;
        if ring_buffer_size == 0 {
            return Err(ConfigError::InvalidValue(
                "RING_BUFFER_SIZE".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let retry_max_attempts = parse_var::<u32>("RETRY_MAX_ATTEMPTS", "3")?;
        if retry_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "RETRY_MAX_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            openai_api_key,
            llm_api_base: var_or("LLM_API_BASE", "https://api.openai.com/v1"),
            chat_model: var_or("CHAT_MODEL", "gpt-4o"),
            tts_model: var_or("TTS_MODEL", "tts-1"),
            tts_voice: var_or("TTS_VOICE", "alloy"),
            speech_enabled: parse_flag("SPEECH_ENABLED", "true")?,
            log_level,
            ring_buffer_size,
            agent_deadline: parse_millis("AGENT_DEADLINE_MS", "30000")?,
            retry_max_attempts,
            retry_base_delay: parse_millis("RETRY_BASE_DELAY_MS", "250")?,
            retry_max_delay: parse_millis("RETRY_MAX_DELAY_MS", "4000")?,
            gap_timeout: parse_millis("GAP_TIMEOUT_MS", "3000")?,
            playback_ack_timeout: parse_millis("PLAYBACK_ACK_TIMEOUT_MS", "30000")?,
            chain_routing: parse_flag("CHAIN_ROUTING", "true")?,
            player_sample_rate: parse_var::<u32>("PLAYER_SAMPLE_RATE", "24000")?,
        })
    }

    pub fn bus(&self) -> BusConfig {
        BusConfig {
            ring_capacity: self.ring_buffer_size,
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            agent_deadline: self.agent_deadline,
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                base_delay: self.retry_base_delay,
                max_delay: self.retry_max_delay,
            },
            ..OrchestratorConfig::default()
        }
    }

    pub fn sequencer(&self) -> SequencerConfig {
        SequencerConfig {
            gap_timeout: self.gap_timeout,
            ack_timeout: self.playback_ack_timeout,
            ..SequencerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const KEYS: &[&str] = &[
        "BIND_ADDRESS",
        "OPENAI_API_KEY",
        "LLM_API_BASE",
        "CHAT_MODEL",
        "TTS_MODEL",
        "TTS_VOICE",
        "SPEECH_ENABLED",
        "RUST_LOG",
        "RING_BUFFER_SIZE",
        "AGENT_DEADLINE_MS",
        "RETRY_MAX_ATTEMPTS",
        "RETRY_BASE_DELAY_MS",
        "RETRY_MAX_DELAY_MS",
        "GAP_TIMEOUT_MS",
        "PLAYBACK_ACK_TIMEOUT_MS",
        "CHAIN_ROUTING",
        "PLAYER_SAMPLE_RATE",
    ];

    fn clear_env_vars() {
        for key in KEYS {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    fn set_minimal_env() {
        unsafe {
            env::set_var("OPENAI_API_KEY", "test-openai-key");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_defaults() {
        clear_env_vars();
        set_minimal_env();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "0.0.0.0:3000");
        assert_eq!(config.openai_api_key, "test-openai-key");
        assert_eq!(config.llm_api_base, "https://api.openai.com/v1");
        assert_eq!(config.chat_model, "gpt-4o");
        assert_eq!(config.tts_model, "tts-1");
        assert_eq!(config.tts_voice, "alloy");
        assert!(config.speech_enabled);
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.ring_buffer_size, 100);
        assert_eq!(config.agent_deadline, Duration::from_secs(30));
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.retry_base_delay, Duration::from_millis(250));
        assert_eq!(config.retry_max_delay, Duration::from_secs(4));
        assert_eq!(config.gap_timeout, Duration::from_secs(3));
        assert_eq!(config.playback_ack_timeout, Duration::from_secs(30));
        assert!(config.chain_routing);
        assert_eq!(config.player_sample_rate, 24_000);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("BIND_ADDRESS", "127.0.0.1:8080");
            env::set_var("CHAT_MODEL", "gpt-4o-mini");
            env::set_var("SPEECH_ENABLED", "false");
            env::set_var("RUST_LOG", "debug");
            env::set_var("RING_BUFFER_SIZE", "16");
            env::set_var("AGENT_DEADLINE_MS", "1500");
            env::set_var("CHAIN_ROUTING", "off");
            env::set_var("PLAYER_SAMPLE_RATE", "48000");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "127.0.0.1:8080");
        assert_eq!(config.chat_model, "gpt-4o-mini");
        assert!(!config.speech_enabled);
        assert_eq!(config.log_level, Level::DEBUG);
        assert!(!config.chain_routing);
        assert_eq!(config.player_sample_rate, 48_000);

        assert_eq!(config.bus().ring_capacity, 16);
        assert_eq!(
            config.orchestrator().agent_deadline,
            Duration::from_millis(1500)
        );
        assert_eq!(config.sequencer().gap_timeout, Duration::from_secs(3));
    }

    #[test]
    #[serial]
    fn test_config_missing_openai_key() {
        clear_env_vars();

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(var) => assert_eq!(var, "OPENAI_API_KEY"),
            _ => panic!("Expected MissingVar for OPENAI_API_KEY"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_values() {
        for (key, value) in [
            ("BIND_ADDRESS", "not-a-valid-address"),
            ("RUST_LOG", "not-a-level"),
            ("RING_BUFFER_SIZE", "0"),
            ("AGENT_DEADLINE_MS", "soon"),
            ("SPEECH_ENABLED", "maybe"),
        ] {
            clear_env_vars();
            set_minimal_env();
            unsafe {
                env::set_var(key, value);
            }
            match Config::from_env().unwrap_err() {
                ConfigError::InvalidValue(var, _) => assert_eq!(var, key),
                other => panic!("Expected InvalidValue for {key}, got {other}"),
            }
        }
    }
}
