//! Configuration for a feed connection

/// Client configuration for one endpoint connection
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint URL the connection is keyed by
    pub url: String,

    /// Reconnect automatically after transport loss
    pub reconnect: bool,

    /// Maximum number of reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Initial reconnect delay in milliseconds, doubled per attempt
    pub reconnect_delay_ms: u64,

    /// Maximum reconnect delay in milliseconds (exponential backoff cap)
    pub max_reconnect_delay_ms: u64,

    /// How long a request may wait for its response, in milliseconds
    pub request_timeout_ms: u64,

    /// Heartbeat ping interval in seconds (0 disables the heartbeat)
    pub heartbeat_interval_secs: u64,

    /// Buffer size of the connection event broadcast channel
    pub event_buffer_size: usize,

    /// Log every raw frame at debug level
    pub log_frames: bool,
}

impl ClientConfig {
    /// Default configuration for the given endpoint
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1000,      // Start with 1 second
            max_reconnect_delay_ms: 30000, // Cap at 30 seconds
            request_timeout_ms: 5000,
            heartbeat_interval_secs: 10,
            event_buffer_size: 1000,
            log_frames: false,
        }
    }
}
