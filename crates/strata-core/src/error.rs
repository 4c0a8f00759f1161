use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within strata.
///
/// Every variant is a configuration or programming error: none of them is a
/// data-dependent runtime condition, so nothing here is retried. A failure
/// aborts the current pipeline build and leaves the affected stage
/// Unconfigured.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A buffer was asked to bind storage of an unsupported element type.
    #[error("type mismatch: buffers only support {expected}, got {got}")]
    TypeMismatch { expected: DType, got: DType },

    /// The buffer/conversion contract was used out of order, or two layouts
    /// that must agree could not be reconciled.
    #[error("layout contract violation: {0}")]
    LayoutContractViolation(String),

    /// A stage received a shape other than the one its configuration demands.
    #[error("shape mismatch in stage '{stage}': expected {expected}, got {got}")]
    ShapeMismatch {
        stage: String,
        expected: Shape,
        got: Shape,
    },

    /// A shape violates a stage's static assumptions.
    #[error("invalid shape {dims:?} for stage '{stage}': {reason}")]
    InvalidShape {
        stage: String,
        dims: Vec<usize>,
        reason: String,
    },

    /// A layout format was combined with dims of the wrong rank.
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Dimension index out of range.
    #[error("dimension out of range: dim {dim} for shape with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Storage is too small for the layout bound to it.
    #[error("element count mismatch: layout needs {expected} elements, storage has {got}")]
    ElementCountMismatch { expected: usize, got: usize },

    /// No constructor is registered under this stage kind.
    #[error("unknown stage kind '{0}'")]
    UnknownStageKind(String),

    /// Invalid pipeline or stage configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn contract(s: impl Into<String>) -> Self {
        Error::LayoutContractViolation(s.into())
    }

    pub fn config(s: impl Into<String>) -> Self {
        Error::Config(s.into())
    }

    pub fn invalid_shape(stage: &str, dims: &[usize], reason: impl Into<String>) -> Self {
        Error::InvalidShape {
            stage: stage.to_string(),
            dims: dims.to_vec(),
            reason: reason.into(),
        }
    }
}

/// Convenience Result type used throughout strata.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
