//! The localized ensemble transform Kalman filter. Every grid point gets
//! its own transform, computed from the observations its localization
//! selects; grid points do not depend on each other.

use nd::{ArrayView2, ArrayViewMut4, Axis};
use nd::parallel::prelude::*;

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use na_core::{EnsembleState, Error, Localization, ObservationSet, Result};

use super::etkf_core::EtkfWeights;
use super::obs_space::ObsSpace;
use super::{apply_weights, check_pseudo_state, update_times, Analyser, FilterConfig};

#[derive(Clone)]
pub struct Letkf {
  config: FilterConfig,
  engine: EtkfWeights,
  localization: Option<Arc<dyn Localization>>,
}

impl fmt::Debug for Letkf {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Letkf")
      .field("config", &self.config)
      .field("localized", &self.localization.is_some())
      .finish()
  }
}

impl Letkf {
  /// Without a localization every grid point uses every observation,
  /// which reproduces the global ETKF.
  pub fn new(config: FilterConfig,
             localization: Option<Arc<dyn Localization>>) -> Result<Letkf> {
    config.validate()?;
    Ok(Letkf {
      engine: EtkfWeights::new(config.inf_factor),
      config,
      localization,
    })
  }

  pub fn config(&self) -> &FilterConfig { &self.config }
  pub fn engine(&self) -> &EtkfWeights { &self.engine }
  pub fn localization(&self) -> Option<&Arc<dyn Localization>> { self.localization.as_ref() }
}

impl Analyser for Letkf {
  fn name(&self) -> &'static str { "LETKF" }

  fn update_state(&self,
                  state: &EnsembleState,
                  observations: &[ObservationSet],
                  pseudo_state: &EnsembleState,
                  analysis_time: u64) -> Result<EnsembleState>
  {
    check_pseudo_state(state, pseudo_state)?;
    let times = update_times(state, analysis_time, self.config.smoother)?;
    let obs = ObsSpace::prepare(observations, pseudo_state, self.config.error_model)?;
    info!("LETKF: {} members, {} grid points, {} observations",
          state.ensemble_size(), state.n_grid(), obs.len());

    let mut values = state.values().to_owned();
    analyse_points(&self.engine,
                   self.localization.as_deref(),
                   &obs,
                   state.grid().coords(),
                   values.view_mut(),
                   times)?;

    state.with_values(values)
  }
}

/// Analyses every grid point of `block` `(variable, time, ensemble, point)`
/// located at `coords` `(point, coordinate)`, writing into the time steps
/// `times`.
pub(crate) fn analyse_points(engine: &EtkfWeights,
                             localization: Option<&dyn Localization>,
                             obs: &ObsSpace,
                             coords: ArrayView2<f64>,
                             mut block: ArrayViewMut4<f64>,
                             times: Range<usize>) -> Result<()>
{
  if coords.nrows() != block.dim().3 {
    return Err(Error::Validation(format!("{} coordinates for {} grid points",
                                         coords.nrows(), block.dim().3)));
  }

  let localization = match localization {
    Some(l) => l,
    None => {
      // the same transform everywhere
      let transform = engine.compute(obs.perturbations.view(), obs.innovation.view())?;
      for t in times {
        for slab in block.slice_mut(s![.., t, .., ..]).outer_iter_mut() {
          apply_weights(slab, transform.weights.view());
        }
      }
      return Ok(());
    },
  };

  block.axis_iter_mut(Axis(3))
    .into_par_iter()
    .enumerate()
    .try_for_each(|(g, mut point)| {
      let (perts, innov) = obs.localized(coords.row(g), Some(localization))?;
      let transform = engine.compute(perts.view(), innov.view())?;
      for t in times.clone() {
        apply_weights(point.slice_mut(s![.., t, ..]).reversed_axes(),
                      transform.weights.view());
      }
      Ok::<(), Error>(())
    })
}
