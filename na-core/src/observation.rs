use nd::{Array1, Array2, Array3, ArrayBase, ArrayView2, ArrayView3, ArrayViewMut1,
         Axis, Data, Ix2};
use nd::linalg::general_mat_vec_mul;
use nd::parallel::prelude::*;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::{EnsembleState, Error, Result};

/// Maps a model state into observation space. The output ordering must
/// match the ordering of the observation vector it is compared against.
pub trait ObservationOperator: Send + Sync {
  fn operator_output_dim(&self) -> usize;
  /// `state` is one member at one time, `(variable, grid)`.
  fn eval_at(&self, state: ArrayView2<f64>, out: ArrayViewMut1<f64>) -> Result<()>;
}

/// A matrix is a linear operator on the flattened `(variable, grid)` state.
impl<D> ObservationOperator for ArrayBase<D, Ix2>
  where D: Data<Elem = f64> + Send + Sync,
{
  fn operator_output_dim(&self) -> usize { self.nrows() }
  fn eval_at(&self, state: ArrayView2<f64>,
             mut out: ArrayViewMut1<f64>) -> Result<()> {
    if state.len() != self.ncols() || out.len() != self.nrows() {
      return Err(Error::Validation(format!("a {:?} operator cannot map a state of {} values into {}",
                                           self.dim(), state.len(), out.len())));
    }
    let flat: Array1<f64> = state.iter().cloned().collect();
    general_mat_vec_mul(1.0, self, &flat, 0.0, &mut out);
    Ok(())
  }
}

/// Observes one variable directly at the given grid points.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionOperator {
  pub variable: usize,
  pub grid_indices: Vec<usize>,
}

impl ObservationOperator for SelectionOperator {
  fn operator_output_dim(&self) -> usize { self.grid_indices.len() }
  fn eval_at(&self, state: ArrayView2<f64>,
             mut out: ArrayViewMut1<f64>) -> Result<()> {
    let (n_vars, n_grid) = state.dim();
    if self.variable >= n_vars {
      return Err(Error::Validation(format!("variable {} out of {}", self.variable, n_vars)));
    }
    for (o, &g) in out.iter_mut().zip(self.grid_indices.iter()) {
      if g >= n_grid {
        return Err(Error::Validation(format!("grid index {} out of {}", g, n_grid)));
      }
      *o = state[[self.variable, g]];
    }
    Ok(())
  }
}

/// Observation error covariance over the observations of one set.
#[derive(Debug, Clone, PartialEq)]
pub enum ObsCovariance {
  /// Variances of uncorrelated errors.
  Diagonal(Array1<f64>),
  Dense(Array2<f64>),
}

impl ObsCovariance {
  pub fn len(&self) -> usize {
    match self {
      ObsCovariance::Diagonal(v) => v.len(),
      ObsCovariance::Dense(m) => m.nrows(),
    }
  }
  pub fn is_empty(&self) -> bool { self.len() == 0 }

  pub fn to_dense(&self) -> Array2<f64> {
    match self {
      ObsCovariance::Diagonal(v) => Array2::from_diag(v),
      ObsCovariance::Dense(m) => m.clone(),
    }
  }

  pub fn diagonal(&self) -> Array1<f64> {
    match self {
      ObsCovariance::Diagonal(v) => v.clone(),
      ObsCovariance::Dense(m) => m.diag().to_owned(),
    }
  }

  pub fn select(&self, indices: &[usize]) -> ObsCovariance {
    match self {
      ObsCovariance::Diagonal(v) => ObsCovariance::Diagonal(v.select(Axis(0), indices)),
      ObsCovariance::Dense(m) => {
        ObsCovariance::Dense(m.select(Axis(0), indices).select(Axis(1), indices))
      },
    }
  }

  /// Block-diagonal concatenation; stays diagonal when every block is.
  pub fn block_diag(blocks: &[ObsCovariance]) -> ObsCovariance {
    let all_diagonal = blocks.iter().all(|b| matches!(b, ObsCovariance::Diagonal(_)));
    if all_diagonal {
      let v = blocks.iter().flat_map(|b| b.diagonal().to_vec()).collect::<Array1<f64>>();
      return ObsCovariance::Diagonal(v);
    }

    let n = blocks.iter().map(|b| b.len()).sum();
    let mut out = Array2::zeros((n, n));
    let mut offset = 0;
    for b in blocks {
      let len = b.len();
      out.slice_mut(s![offset..offset + len, offset..offset + len])
        .assign(&b.to_dense());
      offset += len;
    }
    ObsCovariance::Dense(out)
  }

  pub fn validate(&self) -> Result<()> {
    match self {
      ObsCovariance::Diagonal(v) => {
        if v.iter().any(|&x| !(x > 0.0) || !x.is_finite()) {
          return Err(Error::validation("observation variances must be positive and finite"));
        }
      },
      ObsCovariance::Dense(m) => {
        let (rows, cols) = m.dim();
        if rows != cols {
          return Err(Error::Validation(format!("observation covariance is {}x{}", rows, cols)));
        }
        if m.iter().any(|x| !x.is_finite()) {
          return Err(Error::validation("observation covariance has non-finite entries"));
        }
        let scale = m.iter().fold(0.0f64, |acc, x| acc.max(x.abs()));
        for i in 0..rows {
          for j in i + 1..rows {
            if (m[[i, j]] - m[[j, i]]).abs() > 1e-12 * scale {
              return Err(Error::validation("observation covariance is not symmetric"));
            }
          }
        }
      },
    }
    Ok(())
  }
}

/// Observations of one kind, `(time, observation)`, with their locations
/// `(observation, coordinate)` and the operator producing their model
/// counterparts.
#[derive(Clone)]
pub struct ObservationSet {
  values: Array2<f64>,
  time: Vec<u64>,
  covariance: ObsCovariance,
  grid: Array2<f64>,
  operator: Arc<dyn ObservationOperator>,
}

impl fmt::Debug for ObservationSet {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("ObservationSet")
      .field("values", &self.values)
      .field("time", &self.time)
      .field("covariance", &self.covariance)
      .field("grid", &self.grid)
      .finish()
  }
}

impl ObservationSet {
  pub fn new(values: Array2<f64>,
             time: Vec<u64>,
             covariance: ObsCovariance,
             grid: Array2<f64>,
             operator: Arc<dyn ObservationOperator>) -> Result<ObservationSet>
  {
    let (n_time, n_obs) = values.dim();
    if time.len() != n_time {
      return Err(Error::Validation(format!("{} time steps for {} observation times",
                                           time.len(), n_time)));
    }
    let unique: HashSet<u64> = time.iter().cloned().collect();
    if unique.len() != time.len() {
      return Err(Error::validation("observation time steps must be unique"));
    }
    for &(what, len) in [("covariance", covariance.len()),
                         ("observation grid", grid.nrows()),
                         ("operator output", operator.operator_output_dim())].iter() {
      if len != n_obs {
        return Err(Error::Validation(format!("{} has length {}, expected {}", what, len, n_obs)));
      }
    }
    covariance.validate()?;

    Ok(ObservationSet {
      values,
      time,
      covariance,
      grid,
      operator,
    })
  }

  pub fn values(&self) -> ArrayView2<f64> { self.values.view() }
  pub fn time(&self) -> &[u64] { &self.time }
  pub fn covariance(&self) -> &ObsCovariance { &self.covariance }
  pub fn grid(&self) -> ArrayView2<f64> { self.grid.view() }
  pub fn operator(&self) -> &Arc<dyn ObservationOperator> { &self.operator }
  pub fn n_obs(&self) -> usize { self.values.ncols() }

  /// Position of every observation time on `state_time`.
  pub fn time_indices(&self, state_time: &[u64]) -> Result<Vec<usize>> {
    self.time
      .iter()
      .map(|t| {
        state_time.iter()
          .position(|s| s == t)
          .ok_or_else(|| Error::Validation(format!("observation time {} is not a state time", t)))
      })
      .collect()
  }

  /// Pseudo observations `(time, ensemble, observation)` at every state
  /// time.
  pub fn project(&self, state: &EnsembleState) -> Result<Array3<f64>> {
    let values = state.values();
    let (_, n_time, n_ens, _) = values.dim();
    let mut out = Array3::zeros((n_time, n_ens, self.n_obs()));

    out.axis_iter_mut(Axis(0))
      .into_par_iter()
      .enumerate()
      .try_for_each(|(t, mut slab)| {
        for e in 0..n_ens {
          self.operator.eval_at(values.slice(s![.., t, e, ..]), slab.row_mut(e))?;
        }
        Ok::<(), Error>(())
      })?;

    Ok(out)
  }

  /// Pseudo observations `(time, observation)` of a deterministic state
  /// `(variable, time, grid)`.
  pub fn project_deterministic(&self, state: ArrayView3<f64>) -> Result<Array2<f64>> {
    let n_time = state.dim().1;
    let mut out = Array2::zeros((n_time, self.n_obs()));
    for (t, row) in out.outer_iter_mut().enumerate() {
      self.operator.eval_at(state.index_axis(Axis(1), t), row)?;
    }
    Ok(out)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::Grid;
  use nd::{arr1, arr2, Array4};

  fn state() -> EnsembleState {
    let values = Array4::from_shape_fn((2, 2, 3, 4), |(v, t, e, g)| {
      (v * 1000 + t * 100 + e * 10 + g) as f64
    });
    EnsembleState::new(values, vec![0, 1], Grid::one_dimensional(arr1(&[0., 1., 2., 3.]))).unwrap()
  }

  #[test]
  fn selection_operator_projects() {
    let op = Arc::new(SelectionOperator { variable: 1, grid_indices: vec![3, 0] });
    let obs = ObservationSet::new(Array2::zeros((1, 2)), vec![1],
                                  ObsCovariance::Diagonal(arr1(&[1.0, 1.0])),
                                  arr2(&[[3.0], [0.0]]), op).unwrap();
    let hx = obs.project(&state()).unwrap();
    assert_eq!(hx.dim(), (2, 3, 2));
    assert_eq!(hx[[1, 2, 0]], 1123.0);
    assert_eq!(hx[[0, 1, 1]], 1010.0);
    assert_eq!(obs.time_indices(&[0, 1]).unwrap(), vec![1]);
    assert!(obs.time_indices(&[0, 2]).is_err());
  }

  #[test]
  fn matrix_operator_projects() {
    // mean of variable 0 over the grid
    let mut h = Array2::zeros((1, 8));
    h.slice_mut(s![0, ..4]).fill(0.25);
    let obs = ObservationSet::new(Array2::zeros((1, 1)), vec![0],
                                  ObsCovariance::Dense(arr2(&[[0.5]])),
                                  arr2(&[[1.5]]), Arc::new(h)).unwrap();
    let hx = obs.project(&state()).unwrap();
    approx::assert_abs_diff_eq!(hx[[0, 1, 0]], 11.5, epsilon = 1e-12);
  }

  #[test]
  fn inconsistent_sets_are_rejected() {
    let op = Arc::new(SelectionOperator { variable: 0, grid_indices: vec![0, 1] });
    assert!(ObservationSet::new(Array2::zeros((1, 2)), vec![0],
                                ObsCovariance::Diagonal(arr1(&[1.0])),
                                arr2(&[[0.0], [1.0]]), op.clone()).is_err());
    assert!(ObservationSet::new(Array2::zeros((1, 2)), vec![0],
                                ObsCovariance::Diagonal(arr1(&[1.0, -1.0])),
                                arr2(&[[0.0], [1.0]]), op.clone()).is_err());
    assert!(ObservationSet::new(Array2::zeros((1, 2)), vec![0],
                                ObsCovariance::Dense(arr2(&[[1.0, 0.2], [0.3, 1.0]])),
                                arr2(&[[0.0], [1.0]]), op).is_err());
  }

  #[test]
  fn block_diag_keeps_structure() {
    let a = ObsCovariance::Diagonal(arr1(&[1.0, 2.0]));
    let b = ObsCovariance::Diagonal(arr1(&[3.0]));
    assert_eq!(ObsCovariance::block_diag(&[a.clone(), b]),
               ObsCovariance::Diagonal(arr1(&[1.0, 2.0, 3.0])));

    let c = ObsCovariance::Dense(arr2(&[[1.0, 0.5], [0.5, 1.0]]));
    let dense = ObsCovariance::block_diag(&[a, c]).to_dense();
    assert_eq!(dense, arr2(&[
      [1.0, 0.0, 0.0, 0.0],
      [0.0, 2.0, 0.0, 0.0],
      [0.0, 0.0, 1.0, 0.5],
      [0.0, 0.0, 0.5, 1.0],
    ]));
    assert_eq!(ObsCovariance::Dense(dense).select(&[1, 3]).to_dense(),
               arr2(&[[2.0, 0.0], [0.0, 1.0]]));
  }
}
