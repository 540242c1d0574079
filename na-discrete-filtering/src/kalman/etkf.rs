//! The global ensemble transform Kalman filter: one transform for the
//! whole domain.

use na_core::{EnsembleState, ObservationSet, Result};

use super::etkf_core::{EtkfWeights, Transform};
use super::obs_space::ObsSpace;
use super::{apply_weights, check_pseudo_state, update_times, Analyser, FilterConfig};

#[derive(Debug, Clone)]
pub struct Etkf {
  config: FilterConfig,
  engine: EtkfWeights,
}

impl Etkf {
  pub fn new(config: FilterConfig) -> Result<Etkf> {
    config.validate()?;
    Ok(Etkf {
      engine: EtkfWeights::new(config.inf_factor),
      config,
    })
  }

  pub fn config(&self) -> &FilterConfig { &self.config }

  /// The ensemble-space transform the analysis applies.
  pub fn transform(&self, observations: &[ObservationSet],
                   pseudo_state: &EnsembleState) -> Result<Transform> {
    let obs = ObsSpace::prepare(observations, pseudo_state, self.config.error_model)?;
    self.engine.compute(obs.perturbations.view(), obs.innovation.view())
  }
}

impl Analyser for Etkf {
  fn name(&self) -> &'static str { "ETKF" }

  fn update_state(&self,
                  state: &EnsembleState,
                  observations: &[ObservationSet],
                  pseudo_state: &EnsembleState,
                  analysis_time: u64) -> Result<EnsembleState>
  {
    check_pseudo_state(state, pseudo_state)?;
    let times = update_times(state, analysis_time, self.config.smoother)?;

    let transform = self.transform(observations, pseudo_state)?;
    info!("ETKF: {} members, {} grid points, analysing {} time step(s)",
          state.ensemble_size(), state.n_grid(), times.len());

    let mut values = state.values().to_owned();
    for t in times {
      for v in 0..state.n_vars() {
        apply_weights(values.slice_mut(s![v, t, .., ..]), transform.weights.view());
      }
    }

    state.with_values(values)
  }
}
