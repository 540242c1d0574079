
#[macro_use]
extern crate ndarray as nd;
extern crate num_traits;
extern crate thiserror;

pub use cholesky::*;
pub use error::{FactorizeError, Result};
pub use evd::*;

pub mod cholesky;
pub mod error;
pub mod evd;
