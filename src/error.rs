/**
 * Error taxonomy
 * Every failure the engine can surface, grouped into the kinds callers act on
 */

use std::time::Duration;

use thiserror::Error;

/// Coarse classification used for recovery policy and for what a caller may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Extraction,
    Crypto,
    DimensionMismatch,
    Internal,
}

#[derive(Debug, Clone, Error)]
pub enum FaceError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("no face detected in image")]
    NoFaceDetected,

    #[error("image could not be decoded: {0}")]
    UnreadableImage(String),

    #[error("{count} faces detected; exactly one is required")]
    AmbiguousFaces { count: usize },

    #[error("feature extraction timed out after {0:?}")]
    ExtractionTimeout(Duration),

    #[error("feature extractor unavailable: {0}")]
    ExtractorUnavailable(String),

    #[error("template decryption failed: {0}")]
    Crypto(String),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("identity {0} is already enrolled")]
    AlreadyEnrolled(String),

    #[error("identity {0} not found")]
    IdentityNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FaceError::Input(_) | FaceError::AlreadyEnrolled(_) | FaceError::IdentityNotFound(_) => {
                ErrorKind::Input
            }
            FaceError::NoFaceDetected
            | FaceError::UnreadableImage(_)
            | FaceError::AmbiguousFaces { .. }
            | FaceError::ExtractionTimeout(_)
            | FaceError::ExtractorUnavailable(_) => ErrorKind::Extraction,
            FaceError::Crypto(_) => ErrorKind::Crypto,
            FaceError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            FaceError::Config(_) | FaceError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Text that is safe to hand back to a caller.
    ///
    /// Crypto and internal failures never carry their detail outward; the
    /// detail belongs in the server log.
    pub fn public_message(&self) -> String {
        match self {
            FaceError::Crypto(_) => "template could not be decrypted".to_string(),
            FaceError::ExtractorUnavailable(_) => "feature extractor unavailable".to_string(),
            FaceError::Config(_) | FaceError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

pub type FaceResult<T> = Result<T, FaceError>;
