use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid gateway url or credential: {0}")]
    InvalidRequest(String),

    #[error("connection closed ({code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },

    #[error("client task is no longer running")]
    Disconnected,
}
