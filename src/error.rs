use thiserror::Error;

/// Request-facing error taxonomy.
///
/// Client-caused failures carry a message that is safe to return verbatim.
/// Server-side failures wrap the underlying cause for logging only; the
/// client sees a generic message.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("model load error: {0:#}")]
    ModelLoad(anyhow::Error),

    #[error("inference error: {0:#}")]
    Inference(anyhow::Error),

    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidInput(_) => 400,
            Error::InvalidQuery(_) => 422,
            Error::NotFound(_) => 404,
            Error::Storage(_) | Error::ModelLoad(_) | Error::Inference(_) | Error::Internal(_) => {
                500
            }
        }
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }

    /// Message returned to the client. Never includes the cause of a 5xx.
    pub fn client_message(&self) -> String {
        match self {
            Error::InvalidInput(msg) | Error::InvalidQuery(msg) | Error::NotFound(msg) => {
                msg.clone()
            }
            Error::Storage(_) => "storage failure".to_string(),
            Error::ModelLoad(_) | Error::Inference(_) => "detection failure".to_string(),
            Error::Internal(_) => "internal server error".to_string(),
        }
    }
}
