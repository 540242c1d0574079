//! Ensemble transform Kalman filters: the ensemble-space weight engine,
//! global and localized analyses, a chunked distributed LETKF and a
//! column-wise simplified extended Kalman filter.

#[macro_use]
extern crate ndarray as nd;
#[macro_use]
extern crate log;
extern crate crossbeam_channel;
extern crate na_core;
extern crate nla_factorize;
extern crate rayon;
extern crate serde;
extern crate toml;

pub use na_core::{Error, Result};

pub use cluster::{Client, DistributedConfig, Future, LocalCluster};
pub use kalman::{Analyser, ErrorModel, FilterConfig};
pub use kalman::etkf::Etkf;
pub use kalman::etkf_core::{BatchedTransform, EtkfWeights, InflationFactor, Transform,
                            TransformGrad};
pub use kalman::letkf::Letkf;
pub use kalman::letkf_dist::{DistributedLetkf, PendingAnalysis};
pub use kalman::sekf::{LocalMatrix, Sekf};

pub mod cluster;
pub mod kalman;

#[cfg(test)]
mod testing;
