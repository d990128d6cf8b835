use thiserror::Error;

pub type EstimatorResult<T> = Result<T, EstimatorError>;

#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error("packing density must be positive and finite, got {0}")]
    InvalidPackingDensity(f64),

    #[error("at least one monitoring entry is required")]
    NoMonitoringEntries,
}
