//! Observation-space quantities shared by the filters. Every observation
//! time of every set contributes one block of observations; blocks are
//! concatenated in set order, then time order.

use nd::{concatenate, Array1, Array2, ArrayView1, Axis};

use nla_factorize::{forward_substitute_lstar, Cholesky};

use na_core::{EnsembleState, Error, Localization, ObsCovariance, ObservationSet, Result};

use super::ErrorModel;

/// Whitened observation-space ensemble quantities.
#[derive(Debug, Clone, PartialEq)]
pub struct ObsSpace {
  /// `(obs)`
  pub innovation: Array1<f64>,
  /// `(ensemble, obs)`
  pub perturbations: Array2<f64>,
  /// Observation locations, `(obs, coordinate)`.
  pub grid: Array2<f64>,
}

impl ObsSpace {
  pub fn prepare(observations: &[ObservationSet],
                 pseudo_state: &EnsembleState,
                 error_model: ErrorModel) -> Result<ObsSpace> {
    let n_ens = pseudo_state.ensemble_size();
    let n_dims = coordinate_dims(observations)?;

    let mut innovations = Vec::new();
    let mut perturbations = Vec::new();
    let mut grids = Vec::new();
    for set in observations.iter() {
      let time_idx = set.time_indices(pseudo_state.time())?;
      if time_idx.is_empty() || set.n_obs() == 0 {
        warn!("an observation set contributes no observations");
        continue;
      }
      let hx = set.project(pseudo_state)?;

      for (k, &t) in time_idx.iter().enumerate() {
        let hx_t = hx.index_axis(Axis(0), t);
        let mean = hx_t.sum_axis(Axis(0)) / n_ens as f64;
        let innov = &set.values().row(k) - &mean;
        let perts = &hx_t - &mean;

        let (innov, perts) = whiten(set.covariance(), error_model, innov, perts)?;
        innovations.push(innov);
        perturbations.push(perts);
        grids.push(set.grid().to_owned());
      }
    }

    if innovations.is_empty() {
      return Ok(ObsSpace {
        innovation: Array1::zeros(0),
        perturbations: Array2::zeros((n_ens, 0)),
        grid: Array2::zeros((0, n_dims)),
      });
    }

    Ok(ObsSpace {
      innovation: join(Axis(0), &innovations)?,
      perturbations: join(Axis(1), &perturbations)?,
      grid: join(Axis(0), &grids)?,
    })
  }

  pub fn len(&self) -> usize { self.innovation.len() }
  pub fn is_empty(&self) -> bool { self.len() == 0 }

  /// Perturbations and innovation for the analysis at `grid_point`. With a
  /// localization only observations it selects are kept, scaled by the
  /// square root of their weight; without one every observation is used
  /// as is.
  pub fn localized(&self,
                   grid_point: ArrayView1<f64>,
                   localization: Option<&dyn Localization>) -> Result<(Array2<f64>, Array1<f64>)>
  {
    let localization = match localization {
      Some(l) if !self.is_empty() => l,
      _ => return Ok((self.perturbations.clone(), self.innovation.clone())),
    };

    let (use_obs, weights) = localization.localize_obs(grid_point, self.grid.view())?;
    if use_obs.len() != self.len() || weights.len() != self.len() {
      return Err(Error::Validation(format!("localization returned {} weights for {} observations",
                                           weights.len(), self.len())));
    }
    if let Some(w) = weights.iter().find(|&&w| !(0.0..=1.0).contains(&w)) {
      return Err(Error::Validation(format!("localization weight {} outside [0, 1]", w)));
    }
    let selected = use_obs.iter()
      .enumerate()
      .filter(|&(_, &used)| used)
      .map(|(i, _)| i)
      .collect::<Vec<_>>();
    let scale = weights.select(Axis(0), &selected).mapv_into(f64::sqrt);

    let mut perts = self.perturbations.select(Axis(1), &selected);
    perts *= &scale;
    let innov = self.innovation.select(Axis(0), &selected) * &scale;
    Ok((perts, innov))
  }
}

/// Ensemble-mean observation-space quantities, unwhitened.
#[derive(Debug, Clone, PartialEq)]
pub struct MeanObsSpace {
  pub observed: Array1<f64>,
  /// Projection of the ensemble-mean pseudo state.
  pub pseudo_obs: Array1<f64>,
  pub covariance: ObsCovariance,
  pub grid: Array2<f64>,
}

impl MeanObsSpace {
  pub fn prepare(observations: &[ObservationSet],
                 pseudo_state: &EnsembleState) -> Result<MeanObsSpace> {
    let n_dims = coordinate_dims(observations)?;
    let mean = pseudo_state.ensemble_mean();

    let mut observed = Vec::new();
    let mut pseudo_obs = Vec::new();
    let mut covariances = Vec::new();
    let mut grids = Vec::new();
    for set in observations.iter() {
      let time_idx = set.time_indices(pseudo_state.time())?;
      if time_idx.is_empty() || set.n_obs() == 0 {
        warn!("an observation set contributes no observations");
        continue;
      }
      let hx = set.project_deterministic(mean.view())?;
      for (k, &t) in time_idx.iter().enumerate() {
        observed.push(set.values().row(k).to_owned());
        pseudo_obs.push(hx.row(t).to_owned());
        covariances.push(set.covariance().clone());
        grids.push(set.grid().to_owned());
      }
    }

    if observed.is_empty() {
      return Ok(MeanObsSpace {
        observed: Array1::zeros(0),
        pseudo_obs: Array1::zeros(0),
        covariance: ObsCovariance::Diagonal(Array1::zeros(0)),
        grid: Array2::zeros((0, n_dims)),
      });
    }

    Ok(MeanObsSpace {
      observed: join(Axis(0), &observed)?,
      pseudo_obs: join(Axis(0), &pseudo_obs)?,
      covariance: ObsCovariance::block_diag(&covariances),
      grid: join(Axis(0), &grids)?,
    })
  }

  pub fn len(&self) -> usize { self.observed.len() }
  pub fn is_empty(&self) -> bool { self.len() == 0 }
}

fn coordinate_dims(observations: &[ObservationSet]) -> Result<usize> {
  let mut dims = observations.iter().map(|set| set.grid().ncols());
  let first = dims.next().unwrap_or(0);
  if dims.any(|d| d != first) {
    return Err(Error::validation("observation sets locate their observations in different coordinate dimensions"));
  }
  Ok(first)
}

/// `normed = raw R^-1` with `R^T R` the observation covariance.
fn whiten(covariance: &ObsCovariance,
          error_model: ErrorModel,
          innov: Array1<f64>,
          perts: Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
  match error_model {
    ErrorModel::Correlated => {
      let r = covariance.to_dense().l_lstar()?;
      let innov = forward_substitute_lstar(&r, &innov.insert_axis(Axis(1)))?
        .index_axis_move(Axis(1), 0);
      let perts = forward_substitute_lstar(&r, &perts.t())?.reversed_axes();
      Ok((innov, perts))
    },
    ErrorModel::Uncorrelated => {
      let std = covariance.diagonal().mapv_into(f64::sqrt);
      Ok((innov / &std, perts / &std))
    },
  }
}

fn join<D>(axis: Axis, parts: &[nd::Array<f64, D>]) -> Result<nd::Array<f64, D>>
  where D: nd::RemoveAxis,
{
  let views = parts.iter().map(|p| p.view()).collect::<Vec<_>>();
  concatenate(axis, &views).map_err(|e| Error::Validation(e.to_string()))
}
