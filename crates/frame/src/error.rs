use std::time::Duration;

/// Errors surfaced by pipeline components.
///
/// GPU and shader failures are fatal for the component that raised them;
/// components report the first error and drop later work rather than retry.
/// Precondition violations (bad call ordering, unsupported mixing of
/// formats) are bugs in the caller and panic instead of returning a value
/// of this type.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("gpu error: {0}")]
    Gpu(String),

    #[error("shader error: {0}")]
    Shader(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("processing error: {0}")]
    Processing(String),

    #[error("operation canceled")]
    Canceled,
}
