use thiserror::Error;

/// Boxed error raised by an inference backend.
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type returned by [`Backend`](crate::backend::Backend) methods.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Errors surfaced by the detection, alignment and matching pipeline.
#[derive(Debug, Error)]
pub enum FaceError {
    /// The caller passed something unusable: an empty batch, a zero-sized image, descriptors of
    /// different lengths.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Options are out of range or cannot be combined.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A forward pass (or tensor transfer) failed inside the backend.
    #[error("{network} backend failure")]
    Backend {
        network: String,
        #[source]
        source: BackendError,
    },

    /// The backend returned tensors that do not match the network's output contract.
    #[error("unexpected {network} output: {message}")]
    Output { network: String, message: String },

    /// A network required by the requested stage is not loaded in the context.
    #[error("network '{0}' is not loaded")]
    MissingNetwork(String),

    /// The caller asked a multi-stage detection to stop.
    #[error("detection cancelled")]
    Cancelled,
}

impl FaceError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        FaceError::InvalidInput(message.into())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        FaceError::Configuration(message.into())
    }

    pub(crate) fn output(network: impl Into<String>, message: impl Into<String>) -> Self {
        FaceError::Output {
            network: network.into(),
            message: message.into(),
        }
    }

    /// Wrap a backend error, keeping its source chain.
    pub fn backend(network: impl Into<String>, source: impl Into<BackendError>) -> Self {
        FaceError::Backend {
            network: network.into(),
            source: source.into(),
        }
    }
}

pub type Result<T, E = FaceError> = std::result::Result<T, E>;

/// Reject thresholds outside `[0, 1]` (and NaN).
pub(crate) fn ensure_unit_interval(name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(FaceError::config(format!(
            "{name} must be within [0, 1] (got {value})"
        )))
    }
}

pub(crate) fn ensure_positive(name: &str, value: u32) -> Result<()> {
    if value > 0 {
        Ok(())
    } else {
        Err(FaceError::config(format!("{name} must be greater than zero")))
    }
}
