use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    ConfigError(String),
    /// The request itself is malformed or ambiguous.
    #[error("{0}")]
    ValidationError(String),
    /// The capacity preflight rejected the payment before routing.
    #[error("{0}")]
    AdmissionError(String),
    /// The routing engine failed to complete the payment.
    #[error("{0}")]
    RoutingError(String),
    /// The channel-management engine failed to complete an open or close.
    #[error("{0}")]
    ChannelError(String),
    /// The stream to the client is broken.
    #[error("stream error: {0}")]
    StreamError(String),
}

impl RpcError {
    /// Whether this error belongs to a single item and should be reported
    /// in-band rather than terminating the call.
    pub fn is_per_item(&self) -> bool {
        matches!(
            self,
            RpcError::ValidationError(_) | RpcError::AdmissionError(_) | RpcError::RoutingError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
