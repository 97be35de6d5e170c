//! Configuration validator
//!
//! This module provides functionality for validating configuration.

use super::error::{ConfigError, Result};
use super::ProxyConfig;
use crate::reorder::is_bijection;

/// Validate the configuration
///
/// Only hard errors are reported here; see
/// [`ConfigValidator::check_warnings`] for the rest.
pub fn validate_config(config: &ProxyConfig) -> Result<()> {
    validate_network_settings(config)?;
    validate_reorder_settings(config)?;
    validate_framing_settings(config)
}

/// Validate network settings
fn validate_network_settings(config: &ProxyConfig) -> Result<()> {
    if config.local_host.is_empty() {
        return Err(ConfigError::InvalidValue(
            "local_host".to_string(),
            "Local host must not be empty".to_string(),
        ));
    }

    if config.upstream_host.is_empty() {
        return Err(ConfigError::InvalidValue(
            "upstream_host".to_string(),
            "Upstream host must not be empty".to_string(),
        ));
    }

    if config.upstream_port == 0 {
        return Err(ConfigError::InvalidValue(
            "upstream_port".to_string(),
            "Upstream port must be greater than 0".to_string(),
        ));
    }

    // Relaying to ourselves would loop every connection back into the proxy
    if config.local_host == config.upstream_host && config.local_port == config.upstream_port {
        return Err(ConfigError::InvalidCombination(
            "Local and upstream addresses must be different".to_string(),
        ));
    }

    if config.connection_timeout == 0 {
        return Err(ConfigError::InvalidValue(
            "connection_timeout".to_string(),
            "Connection timeout must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

/// Validate reordering settings
fn validate_reorder_settings(config: &ProxyConfig) -> Result<()> {
    match &config.swap_pattern {
        Some(pattern) => {
            if pattern.is_empty() || !is_bijection(pattern, pattern.len()) {
                return Err(ConfigError::InvalidValue(
                    "swap_pattern".to_string(),
                    format!("{:?} is not a permutation of 0..{}", pattern, pattern.len()),
                ));
            }
        }
        None => {
            if config.window_size < 2 {
                return Err(ConfigError::InvalidValue(
                    "window_size".to_string(),
                    "Window size must be at least 2".to_string(),
                ));
            }
        }
    }

    if config.buffer_capacity == 0 {
        return Err(ConfigError::InvalidValue(
            "buffer_capacity".to_string(),
            "Buffer capacity must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

/// Validate framing settings
fn validate_framing_settings(config: &ProxyConfig) -> Result<()> {
    if config.delimiter.is_empty() {
        return Err(ConfigError::InvalidValue(
            "delimiter".to_string(),
            "Delimiter must not be empty".to_string(),
        ));
    }

    if config.max_frame_size == 0 {
        return Err(ConfigError::InvalidValue(
            "max_frame_size".to_string(),
            "Max frame size must be greater than 0".to_string(),
        ));
    }

    if config.read_buffer_size == 0 {
        return Err(ConfigError::InvalidValue(
            "read_buffer_size".to_string(),
            "Read buffer size must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

/// Configuration validator trait
pub trait ConfigValidator {
    /// Check configuration for settings that are legal but probably unintended
    fn check_warnings(&self) -> Vec<String>;
}

impl ConfigValidator for ProxyConfig {
    fn check_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        match self.log_level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            level => warnings.push(format!("Invalid log level: {}. Using default: info", level)),
        }

        let block = self
            .swap_pattern
            .as_ref()
            .map_or(self.window_size, Vec::len);
        if self.buffer_capacity < block {
            warnings.push(format!(
                "Buffer capacity {} is smaller than the reorder block of {}; \
                 frames will never be reordered",
                self.buffer_capacity, block
            ));
        }

        if self.max_frame_size < self.read_buffer_size {
            warnings.push(format!(
                "Max frame size {} is smaller than the read buffer size {}",
                self.max_frame_size, self.read_buffer_size
            ));
        }

        warnings
    }
}
