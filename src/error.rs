use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("SIP message error: {0}")]
    SipMessageError(#[from] rsip::Error),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("Request timed out: {0}")]
    RequestTimeout(String),

    #[error("timeout after {0}ms: {1}")]
    SdpTimeout(u64, String),

    #[error("Unknown request action: {0}")]
    UnknownAction(String),

    #[error("{0}")]
    RequestFailed(String),

    #[error("invalid state: {0}")]
    BadState(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("registration failure: {0}")]
    RegistrationFailure(String),

    #[error("media failure: {0}")]
    MediaFailure(String),

    #[error("Channel send error: {0}")]
    ChannelSendError(String),

    #[error("connection closed")]
    Closed,

    #[error("Error: {0}")]
    Error(String),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelSendError(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ProtocolError(e.to_string())
    }
}
