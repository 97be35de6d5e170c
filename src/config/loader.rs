//! Configuration loading functionality
//!
//! Configuration is layered, lowest priority first:
//! 1. Default values
//! 2. JSON configuration file (if present)
//! 3. Environment variables prefixed with `REORDER_PROXY_`
//! 4. Command line overrides

use ::config::{Config, Environment, File, FileFormat};
use log::{debug, warn};
use std::path::{Path, PathBuf};

use super::error::ConfigError;
use super::validator::{validate_config, ConfigValidator};
use super::{ProxyConfig, DEFAULT_CONFIG_FILE, ENV_PREFIX};
use crate::common::Result;

/// Values given explicitly on the command line
///
/// Every field is optional; only `Some` values override lower layers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub local_host: Option<String>,
    pub local_port: Option<u16>,
    pub upstream_host: Option<String>,
    pub upstream_port: Option<u16>,
    pub window_size: Option<usize>,
    pub swap_pattern: Option<Vec<usize>>,
    pub buffer_capacity: Option<usize>,
    pub max_frame_size: Option<usize>,
    pub delimiter: Option<String>,
    pub connection_timeout: Option<u64>,
    pub log_level: Option<String>,
}

impl ConfigOverrides {
    /// Apply the overrides on top of `config`
    pub fn apply(&self, config: &mut ProxyConfig) {
        fn set<T: Clone>(field: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *field = value.clone();
            }
        }

        set(&mut config.local_host, &self.local_host);
        set(&mut config.local_port, &self.local_port);
        set(&mut config.upstream_host, &self.upstream_host);
        set(&mut config.upstream_port, &self.upstream_port);
        set(&mut config.window_size, &self.window_size);
        set(&mut config.buffer_capacity, &self.buffer_capacity);
        set(&mut config.max_frame_size, &self.max_frame_size);
        set(&mut config.delimiter, &self.delimiter);
        set(&mut config.connection_timeout, &self.connection_timeout);
        set(&mut config.log_level, &self.log_level);

        if self.swap_pattern.is_some() {
            config.swap_pattern = self.swap_pattern.clone();
        }
    }
}

/// Configuration builder
///
/// Provides a fluent API for building configuration from multiple sources.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    file: Option<PathBuf>,
    env_prefix: Option<String>,
    overrides: ConfigOverrides,
    validate: bool,
}

impl ConfigBuilder {
    /// Create a builder with no sources; `build` then yields the defaults
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: None,
            overrides: ConfigOverrides::default(),
            validate: true,
        }
    }

    /// Add a JSON file source
    ///
    /// A missing file is skipped with a warning.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        debug!("Adding file configuration source: {}", path.display());
        self.file = Some(path.to_path_buf());
        self
    }

    /// Add environment variables with the given prefix
    pub fn with_env(mut self, prefix: &str) -> Self {
        debug!("Adding environment configuration source with prefix: {}", prefix);
        self.env_prefix = Some(prefix.to_string());
        self
    }

    /// Add command line overrides
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Disable validation
    pub fn without_validation(mut self) -> Self {
        self.validate = false;
        self
    }

    /// Build the configuration
    ///
    /// Warnings are logged as they are found. Use
    /// [`build_with_warnings`](ConfigBuilder::build_with_warnings) when the
    /// logger is not initialised yet.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Config` if a source cannot be parsed or the
    /// resulting configuration is invalid.
    pub fn build(self) -> Result<ProxyConfig> {
        let (config, warnings) = self.build_with_warnings()?;
        for warning in &warnings {
            warn!("{}", warning);
        }
        Ok(config)
    }

    /// Build the configuration and return its warnings instead of logging
    ///
    /// Warnings cover a missing configuration file and, when validating,
    /// settings that are legal but probably unintended.
    ///
    /// # Errors
    ///
    /// See [`ConfigBuilder::build`].
    pub fn build_with_warnings(self) -> Result<(ProxyConfig, Vec<String>)> {
        let mut warnings = Vec::new();
        let mut builder = Config::builder();

        if let Some(path) = &self.file {
            if path.exists() {
                debug!("Loading configuration from {}", path.display());
                builder = builder.add_source(File::from(path.as_path()).format(FileFormat::Json));
            } else {
                warnings.push(ConfigError::FileNotFound(path.clone()).to_string());
            }
        }

        if let Some(prefix) = &self.env_prefix {
            builder = builder.add_source(
                Environment::with_prefix(prefix)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("swap_pattern"),
            );
        }

        let mut config: ProxyConfig = builder
            .build()
            .and_then(|layered| layered.try_deserialize())
            .map_err(ConfigError::from)?;

        self.overrides.apply(&mut config);

        if self.validate {
            debug!("Validating configuration");
            validate_config(&config)?;
            warnings.extend(config.check_warnings());
        }

        Ok((config, warnings))
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
            .with_file(DEFAULT_CONFIG_FILE)
            .with_env(ENV_PREFIX)
    }
}

/// Load configuration from every layer
///
/// `config_file` replaces the default file name when given.
///
/// # Errors
///
/// See [`ConfigBuilder::build`].
pub fn auto_load(config_file: Option<&Path>, overrides: ConfigOverrides) -> Result<ProxyConfig> {
    let (config, warnings) = auto_load_with_warnings(config_file, overrides)?;
    for warning in &warnings {
        warn!("{}", warning);
    }
    Ok(config)
}

/// Load configuration from every layer, returning warnings unlogged
///
/// A missing default file is silently skipped; a missing explicit
/// `config_file` is reported as a warning.
///
/// # Errors
///
/// See [`ConfigBuilder::build`].
pub fn auto_load_with_warnings(
    config_file: Option<&Path>,
    overrides: ConfigOverrides,
) -> Result<(ProxyConfig, Vec<String>)> {
    let mut builder = ConfigBuilder::new();
    match config_file {
        Some(path) => builder = builder.with_file(path),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            builder = builder.with_file(DEFAULT_CONFIG_FILE)
        }
        None => debug!("No {} found, skipping file configuration", DEFAULT_CONFIG_FILE),
    }

    builder
        .with_env(ENV_PREFIX)
        .with_overrides(overrides)
        .build_with_warnings()
}
