use thiserror::Error;

/// Result type alias used throughout the crate
pub type TunmanResult<T> = Result<T, TunmanError>;

/// Error taxonomy for the tunnel supervisor
#[derive(Error, Debug)]
pub enum TunmanError {
    /// Malformed input from the configuration loader, fatal at startup
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A remote shell call exhausted its retry budget
    #[error("remote exec error: {0}")]
    RemoteExec(String),

    /// The child SSH process exited within its warm-up window
    #[error("spawn failure: {0}")]
    Spawn(String),

    /// A health check reported the tunnel down
    #[error("health check failure: {0}")]
    HealthCheck(String),

    /// Routing-table output did not match the expected shape
    #[error("failed to parse routing table: {0}")]
    Parse(String),

    /// A topology lookup referenced an interface the routing table never saw
    #[error("unknown interface: {0}")]
    UnknownInterface(String),

    /// Process table / I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound webhook or HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// TOML host-file deserialization failures
    #[error("failed to parse host file: {0}")]
    Toml(#[from] toml::de::Error),
}
