use nd::{ArrayView2, ArrayViewMut2, Axis};
use serde::Deserialize;

use std::ops::Range;

use na_core::{EnsembleState, Error, ObservationSet, Result};

pub mod etkf;
pub mod etkf_core;
pub mod letkf;
pub mod letkf_dist;
pub mod obs_space;
pub mod sekf;

/// How the observation error covariance enters an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorModel {
  /// Dense covariance, folded in through its Cholesky factor.
  Correlated,
  /// Only the variances are used.
  Uncorrelated,
}
impl Default for ErrorModel {
  fn default() -> ErrorModel { ErrorModel::Correlated }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
  pub inf_factor: f64,
  /// Update every time step of the state instead of only the analysis
  /// time.
  pub smoother: bool,
  pub error_model: ErrorModel,
}
impl Default for FilterConfig {
  fn default() -> FilterConfig {
    FilterConfig {
      inf_factor: 1.0,
      smoother: false,
      error_model: ErrorModel::Correlated,
    }
  }
}

impl FilterConfig {
  pub fn from_toml_str(s: &str) -> Result<FilterConfig> {
    let config: FilterConfig = toml::from_str(s)
      .map_err(|e| Error::Configuration(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if !(self.inf_factor > 0.0) || !self.inf_factor.is_finite() {
      return Err(Error::Configuration(format!("inflation factor must be positive, got {}",
                                              self.inf_factor)));
    }
    Ok(())
  }
}

pub trait Analyser {
  fn name(&self) -> &'static str;

  /// Analyses `state` at `analysis_time`, which must be one of its time
  /// steps. `pseudo_state` is projected into observation space in place
  /// of `state`.
  fn update_state(&self,
                  state: &EnsembleState,
                  observations: &[ObservationSet],
                  pseudo_state: &EnsembleState,
                  analysis_time: u64) -> Result<EnsembleState>;

  /// Runs one analysis. Without a pseudo state the state itself is
  /// projected; without an analysis time the last time step is analysed,
  /// otherwise the time step nearest to it.
  fn assimilate(&self,
                state: &EnsembleState,
                observations: &[ObservationSet],
                pseudo_state: Option<&EnsembleState>,
                analysis_time: Option<u64>) -> Result<EnsembleState>
  {
    let pseudo_state = pseudo_state.unwrap_or(state);
    check_pseudo_state(state, pseudo_state)?;
    let analysis_time = nearest_time(state, analysis_time)?;
    info!("{}: assimilating {} observation set(s) at time {}",
          self.name(), observations.len(), analysis_time);
    self.update_state(state, observations, pseudo_state, analysis_time)
  }
}

fn nearest_time(state: &EnsembleState, analysis_time: Option<u64>) -> Result<u64> {
  let times = state.time();
  let nearest = match analysis_time {
    None => times.last().cloned(),
    Some(t) => {
      times.iter()
        .cloned()
        .min_by_key(|&s| if s > t { s - t } else { t - s })
    },
  };
  nearest.ok_or_else(|| Error::validation("the state has no time steps"))
}

pub(crate) fn check_pseudo_state(state: &EnsembleState,
                                 pseudo_state: &EnsembleState) -> Result<()> {
  if state.ensemble_size() != pseudo_state.ensemble_size() {
    return Err(Error::Validation(format!("state has {} members, pseudo state {}",
                                         state.ensemble_size(),
                                         pseudo_state.ensemble_size())));
  }
  Ok(())
}

/// The time steps an analysis at `analysis_time` writes to.
pub(crate) fn update_times(state: &EnsembleState, analysis_time: u64,
                           smoother: bool) -> Result<Range<usize>> {
  let idx = state.time_index(analysis_time)
    .ok_or_else(|| {
      Error::Validation(format!("analysis time {} is not a time step of the state",
                                analysis_time))
    })?;
  if smoother {
    Ok(0..state.n_times())
  } else {
    Ok(idx..idx + 1)
  }
}

/// Replaces the members `(ensemble, point)` by
/// `mean + weights^T (members - mean)`.
pub(crate) fn apply_weights(mut members: ArrayViewMut2<f64>, weights: ArrayView2<f64>) {
  let n = members.nrows() as f64;
  let mean = members.sum_axis(Axis(0)) / n;
  let perts = &members - &mean;
  let mut analysis = weights.t().dot(&perts);
  analysis += &mean;
  members.assign(&analysis);
}
