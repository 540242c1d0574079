//! Containers and collaborator contracts shared by the filters: ensemble
//! states on a (possibly multi-level) grid, observation sets with their
//! operators and error covariances, and localization.

#[macro_use]
extern crate ndarray as nd;
#[macro_use]
extern crate log;
extern crate nla_factorize;
extern crate thiserror;

pub use error::{Error, Result};
pub use localization::{BoxCar, GaspariCohn, Gaussian, Localization};
pub use observation::{ObsCovariance, ObservationOperator, ObservationSet,
                      SelectionOperator};
pub use state::{Column, EnsembleState, Grid};

pub mod error;
pub mod localization;
pub mod observation;
pub mod state;
