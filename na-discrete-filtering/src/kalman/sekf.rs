//! Simplified extended Kalman filter on vertical columns.
//!
//! For every horizontal location the column of grid points below it is
//! analysed with the observations located exactly there:
//!
//! ```text
//! inc = B H^T (H B H^T + R)^-1 (y - h(x_b))
//! ```
//!
//! The increment is a mean correction; it is added to every member, so
//! the spread is left as is. Columns are independent: they run on the
//! rayon pool, or in chunks of columns on a `Client`.

use nd::{Array1, Array2, ArrayView1, Axis};
use nd::parallel::prelude::*;

use nla_factorize::cholesky_solve_vec;

use std::fmt;
use std::sync::Arc;

use na_core::{Column, EnsembleState, Error, ObsCovariance, ObservationSet, Result};

use crate::cluster::{gather_chunks, Client, DistributedConfig, LocalCluster};

use super::obs_space::MeanObsSpace;
use super::{check_pseudo_state, update_times, Analyser, ErrorModel, FilterConfig};

/// Evaluates a local matrix from the local background state and the local
/// pseudo observations.
pub type LocalFn = dyn Fn(ArrayView1<f64>, ArrayView1<f64>) -> Result<Array2<f64>> + Send + Sync;

/// The background covariance or the observation operator Jacobian of one
/// column.
#[derive(Clone)]
pub enum LocalMatrix {
  Fixed(Array2<f64>),
  Lazy(Arc<LocalFn>),
}

impl fmt::Debug for LocalMatrix {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      LocalMatrix::Fixed(m) => f.debug_tuple("Fixed").field(m).finish(),
      LocalMatrix::Lazy(_) => f.write_str("Lazy(..)"),
    }
  }
}

impl From<Array2<f64>> for LocalMatrix {
  fn from(m: Array2<f64>) -> LocalMatrix { LocalMatrix::Fixed(m) }
}

impl LocalMatrix {
  pub fn lazy<F>(f: F) -> LocalMatrix
    where F: Fn(ArrayView1<f64>, ArrayView1<f64>) -> Result<Array2<f64>> + Send + Sync + 'static,
  {
    LocalMatrix::Lazy(Arc::new(f))
  }

  pub fn evaluate(&self, local_state: ArrayView1<f64>,
                  local_pseudo_obs: ArrayView1<f64>) -> Result<Array2<f64>> {
    match self {
      LocalMatrix::Fixed(m) => Ok(m.clone()),
      LocalMatrix::Lazy(f) => f(local_state, local_pseudo_obs),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Sekf {
  config: FilterConfig,
  b_matrix: LocalMatrix,
  h_jacob: LocalMatrix,
  /// Worker pool and columns per task.
  distributed: Option<(Client, usize)>,
}

impl Sekf {
  pub fn new(b_matrix: LocalMatrix, h_jacob: LocalMatrix,
             config: FilterConfig) -> Result<Sekf> {
    config.validate()?;
    if let LocalMatrix::Fixed(b) = &b_matrix {
      if b.nrows() != b.ncols() {
        return Err(Error::Configuration(format!("background covariance is {}x{}",
                                                b.nrows(), b.ncols())));
      }
      if b.iter().any(|v| !v.is_finite()) {
        return Err(Error::configuration("background covariance has non-finite entries"));
      }
    }
    if let LocalMatrix::Fixed(h) = &h_jacob {
      if h.iter().any(|v| !v.is_finite()) {
        return Err(Error::configuration("observation operator Jacobian has non-finite entries"));
      }
    }

    Ok(Sekf {
      config,
      b_matrix,
      h_jacob,
      distributed: None,
    })
  }

  /// Runs the columns as tasks of `chunk_size` columns each. A given client
  /// is used as is; otherwise one is started on `cluster`.
  pub fn distributed(mut self,
                     client: Option<Client>,
                     cluster: Option<&LocalCluster>,
                     chunk_size: usize) -> Result<Sekf> {
    if chunk_size == 0 {
      return Err(Error::configuration("the chunk size must be at least one"));
    }
    self.distributed = Some((Client::connect(client, cluster)?, chunk_size));
    Ok(self)
  }

  pub fn distributed_with(self, dist: &DistributedConfig) -> Result<Sekf> {
    self.distributed(None, Some(&dist.cluster), dist.chunk_size)
  }

  pub fn config(&self) -> &FilterConfig { &self.config }
  pub fn client(&self) -> Option<&Client> { self.distributed.as_ref().map(|(c, _)| c) }
  pub fn chunk_size(&self) -> Option<usize> { self.distributed.as_ref().map(|&(_, n)| n) }

  /// Increments of `columns`, one chunk of columns per task, in column
  /// order.
  fn submit_columns(&self,
                    client: &Client,
                    chunk_size: usize,
                    columns: &[Column],
                    background: Array2<f64>,
                    obs: MeanObsSpace) -> Result<Vec<Array1<f64>>> {
    let background = Arc::new(background);
    let obs = Arc::new(obs);
    let futures = columns.chunks(chunk_size)
      .enumerate()
      .map(|(index, chunk)| {
        debug!("submitting SEKF chunk {} with {} columns", index, chunk.len());
        let local = Sekf {
          distributed: None,
          ..self.clone()
        };
        let chunk = chunk.to_vec();
        let background = background.clone();
        let obs = obs.clone();
        client.submit(move || {
          chunk.iter()
            .map(|column| local.column_increment(column, &background, &obs))
            .collect::<Result<Vec<_>>>()
        })
      })
      .collect::<Vec<_>>();

    let mut increments = Vec::with_capacity(columns.len());
    for part in gather_chunks(futures) {
      increments.extend(part?);
    }
    Ok(increments)
  }

  fn column_increment(&self, column: &Column, background: &Array2<f64>,
                      obs: &MeanObsSpace) -> Result<Array1<f64>> {
    if obs.grid.ncols() != column.location.len() && !obs.is_empty() {
      return Err(Error::Validation(format!("observations have {} coordinates, columns {}",
                                           obs.grid.ncols(), column.location.len())));
    }
    let used = obs.grid
      .outer_iter()
      .enumerate()
      .filter(|(_, loc)| *loc == column.location)
      .map(|(i, _)| i)
      .collect::<Vec<_>>();

    // (variable, level), flattened
    let local_state = background.select(Axis(1), &column.points)
      .iter()
      .cloned()
      .collect::<Array1<f64>>();
    let n_state = local_state.len();
    if used.is_empty() {
      return Ok(Array1::zeros(n_state));
    }
    debug!("SEKF column at {:?}: {} observations", column.location, used.len());

    let pseudo_obs = obs.pseudo_obs.select(Axis(0), &used);
    let innov = obs.observed.select(Axis(0), &used) - &pseudo_obs;

    let h = self.h_jacob.evaluate(local_state.view(), pseudo_obs.view())?;
    let b = self.b_matrix.evaluate(local_state.view(), pseudo_obs.view())?;
    if h.dim() != (used.len(), n_state) {
      return Err(Error::Validation(format!("Jacobian of shape {:?}, expected {:?}",
                                           h.dim(), (used.len(), n_state))));
    }
    if b.dim() != (n_state, n_state) {
      return Err(Error::Validation(format!("background covariance of shape {:?}, expected {:?}",
                                           b.dim(), (n_state, n_state))));
    }

    let bht = b.dot(&h.t());
    let mut innov_prec = h.dot(&bht);
    let cov = obs.covariance.select(&used);
    match (self.config.error_model, &cov) {
      (ErrorModel::Correlated, ObsCovariance::Dense(r)) => innov_prec += r,
      _ => {
        let mut diag = innov_prec.diag_mut();
        diag += &cov.diagonal();
      },
    }

    let norm_innov = cholesky_solve_vec(&innov_prec, &innov)?;
    Ok(bht.dot(&norm_innov))
  }
}

impl Analyser for Sekf {
  fn name(&self) -> &'static str { "SEKF" }

  fn update_state(&self,
                  state: &EnsembleState,
                  observations: &[ObservationSet],
                  pseudo_state: &EnsembleState,
                  analysis_time: u64) -> Result<EnsembleState>
  {
    if !state.grid().is_multi_level() {
      return Err(Error::validation("the SEKF needs a grid with vertical levels, not a one-dimensional grid"));
    }
    check_pseudo_state(state, pseudo_state)?;
    let times = update_times(state, analysis_time, self.config.smoother)?;
    let columns = state.grid().columns()?;
    let obs = MeanObsSpace::prepare(observations, pseudo_state)?;
    info!("SEKF: {} columns, {} grid points, {} observations",
          columns.len(), state.n_grid(), obs.len());

    let t_a = state.time_index(analysis_time)
      .ok_or_else(|| Error::Validation(format!("no state at analysis time {}", analysis_time)))?;
    let background = state.ensemble_mean().index_axis_move(Axis(1), t_a);

    let increments = match &self.distributed {
      Some((client, chunk_size)) => {
        self.submit_columns(client, *chunk_size, &columns, background, obs)?
      },
      None => {
        columns.par_iter()
          .map(|column| self.column_increment(column, &background, &obs))
          .collect::<Result<Vec<_>>>()?
      },
    };

    let n_vars = state.n_vars();
    let mut increment = Array2::zeros((n_vars, state.n_grid()));
    for (column, inc) in columns.iter().zip(increments.iter()) {
      let n_levels = column.points.len();
      for v in 0..n_vars {
        for (l, &p) in column.points.iter().enumerate() {
          increment[[v, p]] = inc[v * n_levels + l];
        }
      }
    }

    let mut values = state.values().to_owned();
    let increment = increment.insert_axis(Axis(1));
    for t in times {
      let mut slab = values.slice_mut(s![.., t, .., ..]);
      slab += &increment;
    }
    state.with_values(values)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::testing::init_logging;
  use na_core::{Grid, SelectionOperator};
  use nd::{arr1, arr2, Array4};

  /// Two columns at x = 0 and x = 1 with two levels each, one variable.
  fn column_state() -> EnsembleState {
    let coords = arr2(&[[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]]);
    let grid = Grid::multi_level(coords, vec!["x".into(), "level".into()]).unwrap();
    let values = Array4::from_shape_fn((1, 2, 3, 4), |(_, t, e, g)| {
      (t as f64) + (e as f64) - 1.0 + g as f64
    });
    EnsembleState::new(values, vec![0, 1], grid).unwrap()
  }

  /// The lower level of both columns, observed 0.7 above the background.
  fn surface_obs(cov: ObsCovariance) -> ObservationSet {
    let state = column_state();
    let mean = state.ensemble_mean();
    let values = arr2(&[[mean[[0, 1, 0]] + 0.7, mean[[0, 1, 2]] + 0.7]]);
    let op = Arc::new(SelectionOperator { variable: 0, grid_indices: vec![0, 2] });
    ObservationSet::new(values, vec![1], cov, arr2(&[[0.0], [1.0]]), op).unwrap()
  }

  fn sekf(error_model: ErrorModel) -> Sekf {
    let config = FilterConfig { error_model, ..Default::default() };
    Sekf::new(LocalMatrix::Fixed(Array2::eye(2) * 0.5),
              LocalMatrix::Fixed(arr2(&[[1.0, 0.0]])),
              config).unwrap()
  }

  #[test]
  fn analytic_increment() {
    init_logging();
    let state = column_state();
    let r = 0.25;
    let obs = surface_obs(ObsCovariance::Diagonal(arr1(&[r, r])));
    let analysis = sekf(ErrorModel::Uncorrelated)
      .assimilate(&state, &[obs], None, None)
      .unwrap();

    let expected = 0.5 / (0.5 + r) * 0.7;
    let diff = &analysis.values() - &state.values();
    for e in 0..3 {
      approx::assert_abs_diff_eq!(diff[[0, 1, e, 0]], expected, epsilon = 1e-12);
      approx::assert_abs_diff_eq!(diff[[0, 1, e, 2]], expected, epsilon = 1e-12);
      // the upper level is not observed and B is diagonal
      approx::assert_abs_diff_eq!(diff[[0, 1, e, 1]], 0.0, epsilon = 1e-12);
    }
    // not a smoother
    assert!(diff.index_axis(Axis(1), 0).iter().all(|&v| v == 0.0));
  }

  #[test]
  fn correlated_equals_uncorrelated_for_diagonal_errors() {
    let state = column_state();
    let r = arr1(&[0.3, 0.6]);
    let dense = sekf(ErrorModel::Correlated)
      .assimilate(&state, &[surface_obs(ObsCovariance::Dense(Array2::from_diag(&r)))], None, None)
      .unwrap();
    let diag = sekf(ErrorModel::Uncorrelated)
      .assimilate(&state, &[surface_obs(ObsCovariance::Diagonal(r))], None, None)
      .unwrap();
    approx::assert_abs_diff_eq!(dense.values(), diag.values(), epsilon = 1e-12);
  }

  #[test]
  fn spread_is_unchanged() {
    let state = column_state();
    let obs = surface_obs(ObsCovariance::Diagonal(arr1(&[0.1, 0.1])));
    let analysis = sekf(ErrorModel::Uncorrelated)
      .assimilate(&state, &[obs], None, None)
      .unwrap();

    let perts = |s: &EnsembleState| {
      let values = s.values();
      let mean = values.mean_axis(Axis(2)).unwrap().insert_axis(Axis(2));
      &values - &mean
    };
    approx::assert_abs_diff_eq!(perts(&analysis), perts(&state), epsilon = 1e-12);
  }

  #[test]
  fn lazy_matrices_see_the_column() {
    let state = column_state();
    let obs = surface_obs(ObsCovariance::Diagonal(arr1(&[0.25, 0.25])));
    let b = LocalMatrix::lazy(|local_state, local_obs| {
      assert_eq!(local_state.len(), 2);
      assert_eq!(local_obs.len(), 1);
      Ok(Array2::eye(2) * 0.5)
    });
    let h = LocalMatrix::lazy(|_, _| Ok(arr2(&[[1.0, 0.0]])));
    let lazy = Sekf::new(b, h, FilterConfig::default()).unwrap()
      .assimilate(&state, &[obs.clone()], None, None)
      .unwrap();
    let fixed = sekf(ErrorModel::Correlated)
      .assimilate(&state, &[obs], None, None)
      .unwrap();
    approx::assert_abs_diff_eq!(lazy.values(), fixed.values(), epsilon = 1e-12);
  }

  const N_COLUMNS: usize = 7;
  const N_LEVELS: usize = 3;

  /// Two variables on `N_COLUMNS` columns of `N_LEVELS` levels.
  fn profile_state() -> EnsembleState {
    let coords = Array2::from_shape_fn((N_COLUMNS * N_LEVELS, 2), |(p, c)| {
      if c == 0 { (p / N_LEVELS) as f64 } else { (p % N_LEVELS) as f64 }
    });
    let grid = Grid::multi_level(coords, vec!["x".into(), "height".into()]).unwrap();
    let values = Array4::from_shape_fn((2, 2, 4, N_COLUMNS * N_LEVELS), |(v, t, e, p)| {
      ((p as f64) * 0.7 + v as f64).sin() + 0.1 * (t as f64) + 0.3 * (e as f64 - 1.5)
    });
    EnsembleState::new(values, vec![0, 1], grid).unwrap()
  }

  /// The surface of variable 0 in every column but the last.
  fn profile_obs(state: &EnsembleState) -> ObservationSet {
    let columns = (0..N_COLUMNS - 1).collect::<Vec<_>>();
    let indices = columns.iter().map(|c| c * N_LEVELS).collect::<Vec<_>>();
    let mean = state.ensemble_mean();
    let values = Array2::from_shape_fn((1, columns.len()), |(_, i)| {
      mean[[0, 1, indices[i]]] + 0.2 * (i as f64) - 0.5
    });
    let grid = Array2::from_shape_fn((columns.len(), 1), |(i, _)| columns[i] as f64);
    let cov = ObsCovariance::Diagonal(Array1::from_elem(columns.len(), 0.4));
    let op = Arc::new(SelectionOperator { variable: 0, grid_indices: indices });
    ObservationSet::new(values, vec![1], cov, grid, op).unwrap()
  }

  fn profile_sekf() -> Sekf {
    let n = 2 * N_LEVELS;
    let b = Array2::from_shape_fn((n, n), |(i, j)| {
      0.5f64.powi((i as i32 - j as i32).abs())
    });
    let mut h = Array2::zeros((1, n));
    h[[0, 0]] = 1.0;
    Sekf::new(LocalMatrix::Fixed(b), LocalMatrix::Fixed(h), FilterConfig::default()).unwrap()
  }

  fn client() -> Client {
    Client::new(&LocalCluster::with_workers(2)).unwrap()
  }

  #[test]
  fn chunked_equals_serial() {
    init_logging();
    let state = profile_state();
    let obs = vec![profile_obs(&state)];
    let serial = profile_sekf().assimilate(&state, &obs, None, None).unwrap();
    assert!(serial.values() != state.values());

    let client = client();
    for &chunk_size in [1usize, 2, 3, 10].iter() {
      let dist = profile_sekf().distributed(Some(client.clone()), None, chunk_size).unwrap();
      assert_eq!(dist.chunk_size(), Some(chunk_size));
      let analysis = dist.assimilate(&state, &obs, None, None).unwrap();
      approx::assert_abs_diff_eq!(analysis.values(), serial.values(), epsilon = 1e-12);
    }
  }

  #[test]
  fn failing_column_chunk_is_attributed() {
    let state = profile_state();
    let obs = vec![profile_obs(&state)];
    let n = 2 * N_LEVELS;
    // the surface background of column 5
    let poisoned = state.ensemble_mean()[[0, 1, 5 * N_LEVELS]];
    let b = LocalMatrix::lazy(move |_, local_obs| {
      if local_obs[0] == poisoned {
        return Err(Error::Numerical("background covariance unavailable".into()));
      }
      Ok(Array2::eye(n) * 0.5)
    });
    let mut h = Array2::zeros((1, n));
    h[[0, 0]] = 1.0;

    let sekf = Sekf::new(b, LocalMatrix::Fixed(h), FilterConfig::default()).unwrap()
      .distributed(Some(client()), None, 2)
      .unwrap();
    match sekf.assimilate(&state, &obs, None, None) {
      // columns 4 and 5 form the third chunk
      Err(Error::Chunk { index, source }) => {
        assert_eq!(index, 2);
        assert!(matches!(*source, Error::Numerical(_)));
      },
      other => panic!("unexpected outcome {:?}", other.map(|s| s.values().dim())),
    }
  }

  #[test]
  fn distributed_configuration() {
    let cluster = LocalCluster::with_workers(3);
    let from_cluster = profile_sekf().distributed(None, Some(&cluster), 4).unwrap();
    assert_eq!(from_cluster.client().map(Client::n_workers), Some(3));

    let given = Client::new(&LocalCluster::with_workers(1)).unwrap();
    let both = profile_sekf().distributed(Some(given), Some(&cluster), 4).unwrap();
    assert_eq!(both.client().map(Client::n_workers), Some(1));

    assert!(profile_sekf().client().is_none());
    assert!(matches!(profile_sekf().distributed(None, None, 4), Err(Error::Configuration(_))));
    assert!(matches!(profile_sekf().distributed(Some(client()), None, 0),
                     Err(Error::Configuration(_))));

    let dist: DistributedConfig = toml::from_str("chunk_size = 2\n[cluster]\nn_workers = 2")
      .unwrap();
    let sekf = profile_sekf().distributed_with(&dist).unwrap();
    assert_eq!(sekf.chunk_size(), Some(2));
    assert_eq!(sekf.client().map(Client::n_workers), Some(2));
  }

  #[test]
  fn one_dimensional_grid_is_rejected() {
    let grid = Grid::one_dimensional(arr1(&[0.0, 1.0]));
    let state = EnsembleState::new(Array4::zeros((1, 1, 3, 2)), vec![0], grid).unwrap();
    let result = sekf(ErrorModel::Correlated).assimilate(&state, &[], None, None);
    assert!(matches!(result, Err(Error::Validation(_))));
  }

  #[test]
  fn bad_matrices() {
    let h = LocalMatrix::Fixed(arr2(&[[1.0, 0.0]]));
    assert!(matches!(Sekf::new(LocalMatrix::Fixed(Array2::zeros((2, 3))), h.clone(),
                               FilterConfig::default()),
                     Err(Error::Configuration(_))));
    let mut b = Array2::eye(2);
    b[[0, 1]] = f64::NAN;
    assert!(matches!(Sekf::new(LocalMatrix::Fixed(b), h.clone(), FilterConfig::default()),
                     Err(Error::Configuration(_))));

    // a Jacobian of the wrong shape surfaces when the column is analysed
    let state = column_state();
    let obs = surface_obs(ObsCovariance::Diagonal(arr1(&[0.25, 0.25])));
    let wrong = Sekf::new(LocalMatrix::Fixed(Array2::eye(2)),
                          LocalMatrix::Fixed(arr2(&[[1.0, 0.0, 0.0]])),
                          FilterConfig::default()).unwrap();
    assert!(matches!(wrong.assimilate(&state, &[obs], None, None), Err(Error::Validation(_))));
  }
}
