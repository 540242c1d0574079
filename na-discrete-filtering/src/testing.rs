//! Lorenz-96 ensembles and point observations for the filter tests.

use nd::{Array1, Array2, Array4, ArrayView1, ArrayViewMut1, Axis};
use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal};

use std::sync::Arc;

use na_core::{EnsembleState, Grid, ObsCovariance, ObservationSet, SelectionOperator};

pub const FORCING: f64 = 8.0;
const DT: f64 = 0.05;

pub fn init_logging() {
  let _ = env_logger::builder().is_test(true).try_init();
}

pub fn lorenz96(x: ArrayView1<f64>, mut dx: ArrayViewMut1<f64>) {
  let n = x.len();
  for i in 0..n {
    dx[i] = (x[(i + 1) % n] - x[(i + n - 2) % n]) * x[(i + n - 1) % n] - x[i] + FORCING;
  }
}

fn rk4(x: &mut Array1<f64>) {
  let n = x.len();
  let mut k = [Array1::zeros(n), Array1::zeros(n), Array1::zeros(n), Array1::zeros(n)];
  lorenz96(x.view(), k[0].view_mut());
  let x1 = &*x + &(&k[0] * (DT / 2.0));
  lorenz96(x1.view(), k[1].view_mut());
  let x2 = &*x + &(&k[1] * (DT / 2.0));
  lorenz96(x2.view(), k[2].view_mut());
  let x3 = &*x + &(&k[2] * DT);
  lorenz96(x3.view(), k[3].view_mut());

  let incr = (&k[0] + &(&k[1] * 2.0) + &(&k[2] * 2.0) + &k[3]) * (DT / 6.0);
  *x += &incr;
}

/// One variable on `n_grid` points, `n_times` model steps, members drawn
/// around a spun-up truth.
pub fn lorenz96_ensemble<R: Rng>(rng: &mut R, n_ens: usize, n_grid: usize,
                                 n_times: usize) -> EnsembleState {
  let mut truth = Array1::from_elem(n_grid, FORCING);
  truth[0] += 0.01;
  for _ in 0..100 {
    rk4(&mut truth);
  }

  let mut values = Array4::zeros((1, n_times, n_ens, n_grid));
  for e in 0..n_ens {
    let mut member = truth.mapv(|v| {
      let z: f64 = StandardNormal.sample(rng);
      v + z
    });
    for t in 0..n_times {
      values.slice_mut(s![0, t, e, ..]).assign(&member);
      rk4(&mut member);
    }
  }

  let grid = Grid::one_dimensional(Array1::range(0.0, n_grid as f64, 1.0));
  let time = (0..n_times as u64).collect();
  EnsembleState::new(values, time, grid).unwrap()
}

/// Observes every `stride`-th grid point of variable 0 at every state
/// time, scattered around the ensemble mean.
pub fn point_observations<R: Rng>(rng: &mut R, state: &EnsembleState, stride: usize,
                                  variance: f64) -> ObservationSet {
  let indices = (0..state.n_grid()).step_by(stride).collect::<Vec<_>>();
  let mean = state.ensemble_mean();
  let noise = Normal::new(0.0, variance.sqrt()).unwrap();

  let values = Array2::from_shape_fn((state.n_times(), indices.len()), |(t, i)| {
    mean[[0, t, indices[i]]] + noise.sample(rng)
  });
  let grid = state.grid().coords().select(Axis(0), &indices);
  let cov = ObsCovariance::Diagonal(Array1::from_elem(indices.len(), variance));
  let op = Arc::new(SelectionOperator { variable: 0, grid_indices: indices });
  ObservationSet::new(values, state.time().to_vec(), cov, grid, op).unwrap()
}

/// Observes the grid points `indices` of variable 0 at every state time
/// with errors correlated as `variance * exp(-|x_i - x_j| / length)`.
pub fn correlated_observations<R: Rng>(rng: &mut R, state: &EnsembleState, indices: &[usize],
                                       variance: f64, length: f64) -> ObservationSet {
  let mean = state.ensemble_mean();
  let grid = state.grid().coords().select(Axis(0), indices);
  let n = indices.len();
  let cov = Array2::from_shape_fn((n, n), |(i, j)| {
    variance * (-(grid[[i, 0]] - grid[[j, 0]]).abs() / length).exp()
  });

  let noise = Normal::new(0.0, variance.sqrt()).unwrap();
  let values = Array2::from_shape_fn((state.n_times(), n), |(t, i)| {
    mean[[0, t, indices[i]]] + noise.sample(rng)
  });
  let op = Arc::new(SelectionOperator { variable: 0, grid_indices: indices.to_vec() });
  ObservationSet::new(values, state.time().to_vec(), ObsCovariance::Dense(cov), grid, op)
    .unwrap()
}

/// `(n, m)` perturbations with zero ensemble mean.
pub fn random_perturbations<R: Rng>(rng: &mut R, n: usize, m: usize) -> Array2<f64> {
  let raw = Array2::<f64>::from_shape_fn((n, m), |_| StandardNormal.sample(rng));
  let mean = raw.sum_axis(Axis(0)) / n as f64;
  raw - &mean
}
