use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Pod inventory query failed: {0}")]
    PodInventory(String),

    #[error("Target not ready: {0}")]
    ServiceUnavailable(String),

    #[error("Upstream error: {0}")]
    BadGateway(String),

    #[error("Upstream request timed out")]
    GatewayTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// HTTP status code this error surfaces as.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Unauthenticated => 401,
            CoreError::Forbidden(_) => 403,
            CoreError::NotFound(_) => 404,
            CoreError::InvalidArgument(_) => 400,
            CoreError::PodInventory(_) | CoreError::BadGateway(_) => 502,
            CoreError::ServiceUnavailable(_) => 503,
            CoreError::GatewayTimeout => 504,
            CoreError::Io(_) | CoreError::Serialization(_) | CoreError::Internal(_) => 500,
        }
    }
}
