use thiserror::Error;

/// Error type shared by every lumen crate
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed, truncated or unsupported model file
    #[error("Invalid model format: {0}")]
    Format(String),

    /// The architecture expects a tensor the file does not contain
    #[error("Missing required tensor: {name}")]
    MissingTensor { name: String },

    /// A backend could not be initialized; callers never get a substitute
    #[error("Backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// The context window is full
    #[error("KV cache exhausted: position {position} exceeds capacity {capacity}")]
    CacheExhausted { position: usize, capacity: usize },

    /// A cached position was written a second time without a reset
    #[error("KV cache position {position} in layer {layer} was already written")]
    PositionAlreadyWritten { layer: usize, position: usize },

    /// A backend result differs from the reference beyond tolerance
    #[error(
        "Backend '{backend}' diverged at index {index}: expected {expected}, got {actual} \
         (tolerance {tolerance})"
    )]
    NumericDivergence { backend: String, index: usize, expected: f32, actual: f32, tolerance: f32 },

    #[error("Invalid tensor shape: {0}")]
    InvalidShape(String),

    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    pub fn backend_unavailable(backend: impl Into<String>, reason: impl ToString) -> Self {
        Self::BackendUnavailable { backend: backend.into(), reason: reason.to_string() }
    }

    pub fn missing_tensor(name: impl Into<String>) -> Self {
        Self::MissingTensor { name: name.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
