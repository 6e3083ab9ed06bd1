use thiserror::Error;

/// Reasons a telemetry document produces no display table
#[derive(Debug, Error)]
pub enum MappingError {
    /// Payload is not valid JSON
    #[error("Telemetry payload is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// JSON is well formed but lacks the expected structure
    #[error("Telemetry payload has unexpected shape: {0}")]
    Schema(String),
}
