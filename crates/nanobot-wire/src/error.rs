//! Wire-level errors.

use nanobot_types::{CoreError, RequestId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The caller supplied an id that is already awaiting a response.
    /// Ids must be unique among in-flight requests on one wire.
    #[error("request id {0} already pending")]
    DuplicateId(RequestId),

    /// The wire was closed while the operation was in flight.
    #[error("wire closed")]
    Closed,

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl WireError {
    pub fn transport(detail: impl std::fmt::Display) -> Self {
        WireError::Core(CoreError::Transport(detail.to_string()))
    }
}

impl From<WireError> for CoreError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Core(core) => core,
            WireError::DuplicateId(id) => {
                CoreError::invalid_params(format!("request id {} already pending", id))
            }
            WireError::Closed => CoreError::Cancelled,
            WireError::Http(e) => CoreError::Transport(e.to_string()),
            WireError::Url(e) => CoreError::Transport(e.to_string()),
        }
    }
}
