//! Error taxonomy shared by the capture path, the model cache and the HTTP layer.

use thiserror::Error;

/// Failures surfaced by pipeline operations.
///
/// Streaming code recovers from `FrameUnavailable`, `ModelUnavailable` and
/// `InferenceFailure` by degrading to the placeholder frame. Request/response
/// operations surface every variant through [`PipelineError::status_code`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("live frame unavailable")]
    FrameUnavailable,

    #[error("no image available to capture")]
    NoFrameAvailable,

    #[error("no usable model asset: {0}")]
    ModelUnavailable(String),

    #[error("inference failed: {0}")]
    InferenceFailure(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("mission {0} is already closed")]
    MissionClosed(i64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// HTTP status used when the error reaches a client.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::NoFrameAvailable | Self::InvalidRequest(_) | Self::MissionClosed(_) => 400,
            Self::FrameUnavailable
            | Self::ModelUnavailable(_)
            | Self::InferenceFailure(_)
            | Self::Persistence(_) => 500,
        }
    }

    /// Stable machine-readable code for structured error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::FrameUnavailable => "frame_unavailable",
            Self::NoFrameAvailable => "no_frame_available",
            Self::ModelUnavailable(_) => "model_unavailable",
            Self::InferenceFailure(_) => "inference_failure",
            Self::NotFound { .. } => "not_found",
            Self::MissionClosed(_) => "mission_closed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Persistence(_) => "persistence_failure",
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
