use thiserror::Error;

pub type Result<T> = ::std::result::Result<T, FactorizeError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FactorizeError {
  #[error("expected a square matrix, got {rows}x{cols}")]
  NotSquare { rows: usize, cols: usize },
  #[error("dimension mismatch: expected {expected}, found {found}")]
  DimensionMismatch { expected: usize, found: usize },
  #[error("matrix contains non-finite entries")]
  NonFinite,
  #[error("matrix is not positive definite (pivot {pivot})")]
  NotPositiveDefinite { pivot: usize },
  #[error("eigendecomposition did not converge after {sweeps} sweeps")]
  NoConvergence { sweeps: usize },
}
