/// Configuration for a server or client stack.
#[derive(Clone)]
pub struct Config {
    /// Size of each loop's shared ingress buffer.
    pub recv_buffer_size: usize,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Enable SO_REUSEPORT on listeners.
    pub reuse_port: bool,
    /// Enable TCP_NODELAY on accepted sockets.
    pub tcp_nodelay: bool,
    /// Close connections idle for this many seconds. 0 disables idle expiry.
    pub idle_timeout_secs: u64,
    /// Worker/thread configuration.
    pub worker: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recv_buffer_size: 1024,
            backlog: 1024,
            reuse_port: false,
            tcp_nodelay: true,
            idle_timeout_secs: 0,
            worker: WorkerConfig::default(),
        }
    }
}

/// Configuration for the worker loop pool.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Number of worker loops. 0 = serve connections on the main loop.
    pub threads: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { threads: 0 }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

/// Configuration for logging initialization.
#[derive(Clone)]
pub struct LoggingConfig {
    /// Minimum level ("trace", "debug", "info", "warn", "error").
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Include timestamps in output.
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            timestamps: true,
        }
    }
}
