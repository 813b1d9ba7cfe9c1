use thiserror::Error;

/// Failures are scoped to one unit of work (one image, one download) and
/// never put the whole application into an error state.
#[derive(Debug, Error)]
pub enum Error {
    /// An ML capability has not been downloaded or initialized yet.
    #[error("{0} is not available yet")]
    CapabilityUnavailable(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The model answered, but not with the structured object we asked for.
    #[error("malformed model output: {0}")]
    MalformedOutput(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Whether re-invoking the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Network(_) | Error::CapabilityUnavailable(_) | Error::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn transient_failures_are_retryable() {
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_retryable());
        assert!(Error::CapabilityUnavailable("llm".into()).is_retryable());
        assert!(!Error::MalformedOutput("no json".into()).is_retryable());
        assert!(!Error::NotFound("content://media/1".into()).is_retryable());
    }

    #[test]
    fn messages_name_the_failure() {
        let err = Error::CapabilityUnavailable("image description".into());
        assert_eq!(err.to_string(), "image description is not available yet");
    }
}
