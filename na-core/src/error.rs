use nla_factorize::FactorizeError;
use thiserror::Error;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid configuration: {0}")]
  Configuration(String),
  #[error("validation failed: {0}")]
  Validation(String),
  #[error("numerical failure: {0}")]
  Numerical(String),
  /// A chunk of a distributed analysis failed; the other chunks are
  /// unaffected.
  #[error("chunk {index} failed: {source}")]
  Chunk {
    index: usize,
    source: Box<Error>,
  },
  #[error("worker task failed: {0}")]
  Task(String),
}

impl Error {
  pub fn validation<S: Into<String>>(msg: S) -> Error {
    Error::Validation(msg.into())
  }
  pub fn configuration<S: Into<String>>(msg: S) -> Error {
    Error::Configuration(msg.into())
  }
}

impl From<FactorizeError> for Error {
  fn from(v: FactorizeError) -> Error {
    match v {
      FactorizeError::NotSquare { .. } |
      FactorizeError::DimensionMismatch { .. } => Error::Validation(v.to_string()),
      FactorizeError::NonFinite |
      FactorizeError::NotPositiveDefinite { .. } |
      FactorizeError::NoConvergence { .. } => Error::Numerical(v.to_string()),
    }
  }
}
