//! Configuration module
//!
//! This module handles proxy configuration: a strongly typed [`ProxyConfig`]
//! record, its defaults, layered loading from files, environment variables and
//! command line overrides, and validation.

pub mod defaults;
pub mod error;
mod loader;
mod validator;

pub use self::defaults::{DEFAULT_CONFIG_FILE, ENV_PREFIX};
pub use self::error::ConfigError;
pub use self::loader::{auto_load, auto_load_with_warnings, ConfigBuilder, ConfigOverrides};
pub use self::validator::{validate_config, ConfigValidator};

use log::info;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{resolve, ProxyError, Result};
use crate::frame::{BoundaryRule, Delimiter};
use crate::reorder::{ReorderPolicy, SwapPattern, WindowReversal};

/// Proxy configuration
///
/// Everything the harness needs to stand up one reordering proxy in front of
/// one upstream server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    // --- Network settings ---

    /// Host the proxy listens on
    pub local_host: String,

    /// Port the proxy listens on (0 picks an ephemeral port)
    pub local_port: u16,

    /// Host of the real server
    pub upstream_host: String,

    /// Port of the real server
    pub upstream_port: u16,

    /// Upstream connection timeout in seconds
    pub connection_timeout: u64,

    // --- Reordering settings ---

    /// Window size for the default window reversal policy
    pub window_size: usize,

    /// Explicit per-block permutation; takes precedence over `window_size`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap_pattern: Option<Vec<usize>>,

    /// Frames held per direction before the reader stalls
    pub buffer_capacity: usize,

    // --- Framing settings ---

    /// Frame terminator; `\n`, `\r`, `\t`, `\0` and `\\` escapes are understood
    pub delimiter: String,

    /// Maximum unconsumed bytes held while waiting for a frame boundary
    pub max_frame_size: usize,

    /// Size of each socket read
    pub read_buffer_size: usize,

    // --- General settings ---

    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            local_host: defaults::local_host(),
            local_port: defaults::local_port(),
            upstream_host: defaults::upstream_host(),
            upstream_port: defaults::upstream_port(),
            connection_timeout: defaults::connection_timeout(),
            window_size: defaults::window_size(),
            swap_pattern: None,
            buffer_capacity: defaults::buffer_capacity(),
            delimiter: defaults::delimiter(),
            max_frame_size: defaults::max_frame_size(),
            read_buffer_size: defaults::read_buffer_size(),
            log_level: defaults::log_level(),
        }
    }
}

impl ProxyConfig {
    /// Configuration for a proxy on `local_host:local_port` in front of
    /// `upstream_host:upstream_port`, other settings at their defaults
    pub fn new(
        local_host: impl Into<String>,
        local_port: u16,
        upstream_host: impl Into<String>,
        upstream_port: u16,
    ) -> Self {
        Self {
            local_host: local_host.into(),
            local_port,
            upstream_host: upstream_host.into(),
            upstream_port,
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file, without environment or overrides
    ///
    /// Missing fields take their default values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::FileNotFound(path.to_path_buf()),
            _ => ConfigError::FileReadError(path.to_path_buf(), e.to_string()),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(ConfigError::from)?;
        Ok(config)
    }

    /// Derive the configuration for the `index`-th test client
    ///
    /// Each client gets its own proxy on consecutive local ports in front of
    /// the same upstream. An ephemeral base port stays ephemeral.
    pub fn for_client(&self, index: u16) -> Result<Self> {
        let local_port = if self.local_port == 0 {
            0
        } else {
            self.local_port.checked_add(index).ok_or_else(|| {
                ProxyError::Config(format!(
                    "Client index {} overflows local port {}",
                    index, self.local_port
                ))
            })?
        };
        Ok(Self { local_port, ..self.clone() })
    }

    /// Resolved listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        resolve(&self.local_host, self.local_port)
    }

    /// Upstream address as `host:port`, resolved on every connect
    pub fn upstream_addr(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }

    /// Upstream connection timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    /// Delimiter bytes with escapes expanded
    pub fn delimiter_bytes(&self) -> Vec<u8> {
        unescape(&self.delimiter)
    }

    /// Build the frame boundary rule
    pub fn boundary_rule(&self) -> Result<Arc<dyn BoundaryRule>> {
        Ok(Arc::new(Delimiter::new(self.delimiter_bytes())?))
    }

    /// Build the reorder policy described by this configuration
    pub fn build_policy(&self) -> Result<Arc<dyn ReorderPolicy>> {
        match &self.swap_pattern {
            Some(pattern) => Ok(Arc::new(SwapPattern::new(pattern.clone())?)),
            None => Ok(Arc::new(WindowReversal::new(self.window_size)?)),
        }
    }

    /// Log the effective configuration
    pub fn log(&self) {
        info!("Listen address: {}:{}", self.local_host, self.local_port);
        info!("Upstream address: {}", self.upstream_addr());
        match &self.swap_pattern {
            Some(pattern) => info!("Reorder policy: swap pattern {:?}", pattern),
            None => info!("Reorder policy: window reversal (window {})", self.window_size),
        }
        info!(
            "Buffer capacity: {} frames, max frame size: {} bytes, delimiter: {:?}",
            self.buffer_capacity, self.max_frame_size, self.delimiter
        );
    }
}

/// Expand backslash escapes in a delimiter string
fn unescape(raw: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut utf8 = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('r') => out.push(b'\r'),
            Some('t') => out.push(b'\t'),
            Some('0') => out.push(0),
            Some('\\') => out.push(b'\\'),
            Some(other) => {
                out.push(b'\\');
                let mut utf8 = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes());
            }
            None => out.push(b'\\'),
        }
    }
    out
}
