//! Default configuration values
//!
//! Single source of truth for defaults. The port numbers follow the layout the
//! messaging test suite uses: one proxy per test client starting at 15224,
//! all relaying to a server on 5222.

/// Environment variable prefix for all configuration options
///
/// Variables are read as `REORDER_PROXY_<FIELD>`, e.g. `REORDER_PROXY_LOCAL_PORT`.
pub const ENV_PREFIX: &str = "REORDER_PROXY";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "reorder-proxy.json";

/// Default local host
pub const LOCAL_HOST: &str = "127.0.0.1";

/// Default local port for the first client's proxy
pub const LOCAL_PORT: u16 = 15224;

/// Default upstream host
pub const UPSTREAM_HOST: &str = "127.0.0.1";

/// Default upstream port (XMPP client-to-server)
pub const UPSTREAM_PORT: u16 = 5222;

/// Default log level
pub const LOG_LEVEL: &str = "info";

/// Default local host
pub fn local_host() -> String {
    LOCAL_HOST.to_string()
}

/// Default local port
pub fn local_port() -> u16 {
    LOCAL_PORT
}

/// Default upstream host
pub fn upstream_host() -> String {
    UPSTREAM_HOST.to_string()
}

/// Default upstream port
pub fn upstream_port() -> u16 {
    UPSTREAM_PORT
}

/// Default reorder window
pub fn window_size() -> usize {
    2
}

/// Default frames held per direction before the reader stalls
pub fn buffer_capacity() -> usize {
    1024
}

/// Default limit on unconsumed bytes (1 MiB)
pub fn max_frame_size() -> usize {
    1024 * 1024
}

/// Default socket read buffer size (8KB)
pub fn read_buffer_size() -> usize {
    8192
}

/// Default frame delimiter
pub fn delimiter() -> String {
    "\n".to_string()
}

/// Default upstream connection timeout in seconds
pub fn connection_timeout() -> u64 {
    30
}

/// Default log level
pub fn log_level() -> String {
    LOG_LEVEL.to_string()
}
