//! Configuration module
//!
//! Provides typed access to environment variables for the B2BUA.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;

/// Typed configuration keys
///
/// Using an enum for config keys provides compile-time safety
/// and prevents typos compared to string literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    SipHost,
    SipPort,
    ServerAddress,
    RtpHost,
    RtpPort,
    ExtMin,
    ExtMax,
    CallSetupTimeoutMs,
    RegistrationTimeoutSecs,
    CleanupIntervalMs,
    HistoryCapacity,
}

impl ConfigKey {
    /// Get the environment variable name for this key
    pub fn env_var(&self) -> &'static str {
        match self {
            ConfigKey::SipHost => "SIP_HOST",
            ConfigKey::SipPort => "SIP_PORT",
            ConfigKey::ServerAddress => "SERVER_ADDRESS",
            ConfigKey::RtpHost => "RTP_HOST",
            ConfigKey::RtpPort => "RTP_PORT",
            ConfigKey::ExtMin => "EXT_MIN",
            ConfigKey::ExtMax => "EXT_MAX",
            ConfigKey::CallSetupTimeoutMs => "CALL_SETUP_TIMEOUT_MS",
            ConfigKey::RegistrationTimeoutSecs => "REGISTRATION_TIMEOUT_SECS",
            ConfigKey::CleanupIntervalMs => "CLEANUP_INTERVAL_MS",
            ConfigKey::HistoryCapacity => "HISTORY_CAPACITY",
        }
    }

    /// Check if this key is required (no default value)
    pub fn is_required(&self) -> bool {
        matches!(self, ConfigKey::ServerAddress)
    }

    /// Get default value for this key (if any)
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            ConfigKey::SipHost => Some("0.0.0.0"),
            ConfigKey::SipPort => Some("5060"),
            ConfigKey::RtpHost => Some("0.0.0.0"),
            ConfigKey::RtpPort => Some("10000"),
            ConfigKey::ExtMin => Some("100"),
            ConfigKey::ExtMax => Some("110"),
            ConfigKey::CallSetupTimeoutMs => Some("30000"),
            ConfigKey::RegistrationTimeoutSecs => Some("3600"),
            ConfigKey::CleanupIntervalMs => Some("60000"),
            ConfigKey::HistoryCapacity => Some("1000"),
            ConfigKey::ServerAddress => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub sip_host: String,
    pub sip_port: u16,
    /// External IP inserted into rewritten SDP and the server's own Via
    pub server_address: String,
    pub rtp_host: String,
    pub rtp_port: u16,
    /// Inclusive range of valid extensions
    pub ext_min: u32,
    pub ext_max: u32,
    pub call_setup_timeout_ms: u64,
    pub registration_timeout_secs: u64,
    pub cleanup_interval_ms: u64,
    /// Capacity of the registration/call history ring buffers
    pub history_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env if present, ignore if missing
        Self::from_getter(|key| std::env::var(key.env_var()).ok())
    }

    /// Parse config from a custom getter function (for testing)
    pub fn from_getter<F>(get: F) -> Result<Self>
    where
        F: Fn(ConfigKey) -> Option<String>,
    {
        let get_parsed = |key: ConfigKey| -> Result<String> {
            get(key)
                .or_else(|| key.default_value().map(|v| v.to_string()))
                .with_context(|| key.env_var().to_string())
        };

        let parse_num = |key: ConfigKey| -> Result<u64> {
            get_parsed(key)?
                .parse()
                .with_context(|| format!("{} must be a valid number", key.env_var()))
        };

        let config = Config {
            sip_host: get_parsed(ConfigKey::SipHost)?,
            sip_port: get_parsed(ConfigKey::SipPort)?
                .parse()
                .with_context(|| format!("{} must be a valid port number", ConfigKey::SipPort.env_var()))?,
            server_address: get(ConfigKey::ServerAddress)
                .context(ConfigKey::ServerAddress.env_var())?,
            rtp_host: get_parsed(ConfigKey::RtpHost)?,
            rtp_port: get_parsed(ConfigKey::RtpPort)?
                .parse()
                .with_context(|| format!("{} must be a valid port number", ConfigKey::RtpPort.env_var()))?,
            ext_min: parse_num(ConfigKey::ExtMin)? as u32,
            ext_max: parse_num(ConfigKey::ExtMax)? as u32,
            call_setup_timeout_ms: parse_num(ConfigKey::CallSetupTimeoutMs)?,
            registration_timeout_secs: parse_num(ConfigKey::RegistrationTimeoutSecs)?,
            cleanup_interval_ms: parse_num(ConfigKey::CleanupIntervalMs)?,
            history_capacity: parse_num(ConfigKey::HistoryCapacity)? as usize,
        };

        Ok(config)
    }

    /// Create config from a HashMap (convenience for testing)
    #[cfg(test)]
    pub fn from_map(map: &HashMap<&str, &str>) -> Result<Self> {
        Self::from_getter(|key| map.get(key.env_var()).map(|v| v.to_string()))
    }

    /// Validate configuration values at startup.
    /// Returns Ok(()) if all validations pass, or Err with details of what failed.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.ext_min > self.ext_max {
            errors.push(format!(
                "EXT_MIN ({}) must not exceed EXT_MAX ({})",
                self.ext_min, self.ext_max
            ));
        }

        if self.cleanup_interval_ms == 0 {
            errors.push("CLEANUP_INTERVAL_MS must be greater than 0".to_string());
        }

        if self.call_setup_timeout_ms == 0 {
            errors.push("CALL_SETUP_TIMEOUT_MS must be greater than 0".to_string());
        }

        if self.history_capacity == 0 {
            errors.push("HISTORY_CAPACITY must be greater than 0".to_string());
        }

        if self.server_address.trim().is_empty() {
            errors.push("SERVER_ADDRESS cannot be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )
        }
    }

    /// Inclusive range of valid extensions, as decimal strings.
    pub fn extensions(&self) -> impl Iterator<Item = String> + '_ {
        (self.ext_min..=self.ext_max).map(|n| n.to_string())
    }

    /// Whether a numeric extension string falls within the configured range.
    pub fn is_valid_extension(&self, number: &str) -> bool {
        match number.parse::<u32>() {
            Ok(n) => n >= self.ext_min && n <= self.ext_max,
            Err(_) => false,
        }
    }
}
