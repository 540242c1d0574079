use nd::{Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView4, Axis};

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use crate::{Error, Result};

/// Grid point locations, one row per grid point. A multi-level grid names
/// each coordinate; its last coordinate is the vertical one.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
  coords: Array2<f64>,
  level_names: Option<Vec<String>>,
}

/// The grid points sharing one horizontal location.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
  pub location: Array1<f64>,
  /// Indices into the grid, in grid order.
  pub points: Vec<usize>,
}

impl Grid {
  pub fn one_dimensional(coords: Array1<f64>) -> Grid {
    Grid {
      coords: coords.insert_axis(Axis(1)),
      level_names: None,
    }
  }

  pub fn multi_level(coords: Array2<f64>, level_names: Vec<String>) -> Result<Grid> {
    if level_names.len() < 2 {
      return Err(Error::validation("a multi-level grid needs at least two levels"));
    }
    if level_names.len() != coords.ncols() {
      return Err(Error::Validation(format!("{} level names for {} coordinates",
                                           level_names.len(), coords.ncols())));
    }
    Ok(Grid {
      coords,
      level_names: Some(level_names),
    })
  }

  pub fn len(&self) -> usize { self.coords.nrows() }
  pub fn is_empty(&self) -> bool { self.len() == 0 }
  pub fn n_dims(&self) -> usize { self.coords.ncols() }
  pub fn coords(&self) -> ArrayView2<f64> { self.coords.view() }
  pub fn point(&self, i: usize) -> ArrayView1<f64> { self.coords.row(i) }
  pub fn level_names(&self) -> Option<&[String]> { self.level_names.as_deref() }

  pub fn is_multi_level(&self) -> bool {
    self.level_names.as_ref().map_or(false, |n| n.len() > 1)
  }

  pub fn slice(&self, range: Range<usize>) -> Grid {
    Grid {
      coords: self.coords.slice(s![range, ..]).to_owned(),
      level_names: self.level_names.clone(),
    }
  }

  /// Groups the grid points by their horizontal location, in order of
  /// first appearance.
  pub fn columns(&self) -> Result<Vec<Column>> {
    if !self.is_multi_level() {
      return Err(Error::validation("cannot split a one-dimensional grid into vertical columns"));
    }
    let h = self.n_dims() - 1;

    let mut lookup: HashMap<Vec<u64>, usize> = HashMap::new();
    let mut columns: Vec<Column> = Vec::new();
    for (i, row) in self.coords.outer_iter().enumerate() {
      let location = row.slice(s![..h]);
      // -0.0 and 0.0 are the same location
      let key = location.iter().map(|v| (v + 0.0).to_bits()).collect::<Vec<_>>();
      let idx = *lookup.entry(key).or_insert_with(|| {
        columns.push(Column {
          location: location.to_owned(),
          points: Vec::new(),
        });
        columns.len() - 1
      });
      columns[idx].points.push(i);
    }

    debug!("{} grid points in {} columns", self.len(), columns.len());
    Ok(columns)
  }
}

/// An ensemble of model states, laid out `(variable, time, ensemble, grid)`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleState {
  values: Array4<f64>,
  time: Vec<u64>,
  grid: Grid,
}

impl EnsembleState {
  pub fn new(values: Array4<f64>, time: Vec<u64>, grid: Grid) -> Result<EnsembleState> {
    let (_, n_time, n_ens, n_grid) = values.dim();
    if time.len() != n_time {
      return Err(Error::Validation(format!("{} time steps for a time axis of length {}",
                                           time.len(), n_time)));
    }
    if grid.len() != n_grid {
      return Err(Error::Validation(format!("{} grid points for a grid axis of length {}",
                                           grid.len(), n_grid)));
    }
    if n_ens < 2 {
      return Err(Error::Validation(format!("an ensemble needs at least two members, got {}",
                                           n_ens)));
    }
    let unique: HashSet<u64> = time.iter().cloned().collect();
    if unique.len() != time.len() {
      return Err(Error::validation("time steps must be unique"));
    }

    Ok(EnsembleState {
      values,
      time,
      grid,
    })
  }

  pub fn values(&self) -> ArrayView4<f64> { self.values.view() }
  pub fn into_values(self) -> Array4<f64> { self.values }
  pub fn time(&self) -> &[u64] { &self.time }
  pub fn grid(&self) -> &Grid { &self.grid }

  pub fn n_vars(&self) -> usize { self.values.dim().0 }
  pub fn n_times(&self) -> usize { self.values.dim().1 }
  pub fn ensemble_size(&self) -> usize { self.values.dim().2 }
  pub fn n_grid(&self) -> usize { self.values.dim().3 }

  pub fn time_index(&self, t: u64) -> Option<usize> {
    self.time.iter().position(|&v| v == t)
  }

  /// `(variable, time, grid)`
  pub fn ensemble_mean(&self) -> Array3<f64> {
    self.values.sum_axis(Axis(2)) / self.ensemble_size() as f64
  }

  /// A state with the same coordinates and new values.
  pub fn with_values(&self, values: Array4<f64>) -> Result<EnsembleState> {
    if values.dim() != self.values.dim() {
      return Err(Error::Validation(format!("values of shape {:?} replace a state of shape {:?}",
                                           values.dim(), self.values.dim())));
    }
    Ok(EnsembleState {
      values,
      time: self.time.clone(),
      grid: self.grid.clone(),
    })
  }

  pub fn select_grid(&self, range: Range<usize>) -> Result<EnsembleState> {
    if range.start > range.end || range.end > self.n_grid() {
      return Err(Error::Validation(format!("grid range {:?} out of bounds for {} points",
                                           range, self.n_grid())));
    }
    Ok(EnsembleState {
      values: self.values.slice(s![.., .., .., range.clone()]).to_owned(),
      time: self.time.clone(),
      grid: self.grid.slice(range),
    })
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use nd::{arr1, arr2};

  fn vertical_grid() -> Grid {
    let coords = arr2(&[
      [0.0, 0.0],
      [0.0, 1.0],
      [1.0, 0.0],
      [1.0, 1.0],
      [-0.0, 2.0],
    ]);
    Grid::multi_level(coords, vec!["x".into(), "level".into()]).unwrap()
  }

  #[test]
  fn columns_group_by_horizontal_location() {
    let columns = vertical_grid().columns().unwrap();
    assert_eq!(columns.len(), 2);
    assert_eq!(columns[0].location, arr1(&[0.0]));
    assert_eq!(columns[0].points, vec![0, 1, 4]);
    assert_eq!(columns[1].points, vec![2, 3]);
  }

  #[test]
  fn one_dimensional_grid_has_no_columns() {
    let grid = Grid::one_dimensional(arr1(&[0.0, 1.0, 2.0]));
    assert!(!grid.is_multi_level());
    assert!(matches!(grid.columns(), Err(Error::Validation(_))));
  }

  #[test]
  fn multi_level_needs_matching_names() {
    let coords = Array2::zeros((3, 2));
    assert!(Grid::multi_level(coords.clone(), vec!["x".into()]).is_err());
    assert!(Grid::multi_level(coords, vec!["x".into(), "y".into(), "z".into()]).is_err());
  }

  #[test]
  fn state_validates_shapes() {
    let grid = Grid::one_dimensional(arr1(&[0.0, 1.0, 2.0]));
    assert!(EnsembleState::new(Array4::zeros((1, 2, 3, 3)), vec![0, 1], grid.clone()).is_ok());
    assert!(EnsembleState::new(Array4::zeros((1, 2, 3, 3)), vec![0], grid.clone()).is_err());
    assert!(EnsembleState::new(Array4::zeros((1, 2, 3, 4)), vec![0, 1], grid.clone()).is_err());
    assert!(EnsembleState::new(Array4::zeros((1, 2, 1, 3)), vec![0, 1], grid.clone()).is_err());
    assert!(EnsembleState::new(Array4::zeros((1, 2, 3, 3)), vec![1, 1], grid).is_err());
  }

  #[test]
  fn mean_and_grid_selection() {
    let grid = Grid::one_dimensional(arr1(&[0.0, 1.0, 2.0]));
    let values = Array4::from_shape_fn((1, 1, 2, 3), |(_, _, e, g)| (e * 10 + g) as f64);
    let state = EnsembleState::new(values, vec![7], grid).unwrap();

    let mean = state.ensemble_mean();
    assert_eq!(mean.index_axis(Axis(0), 0).row(0), arr1(&[5.0, 6.0, 7.0]));

    let part = state.select_grid(1..3).unwrap();
    assert_eq!(part.n_grid(), 2);
    assert_eq!(part.grid().point(0), arr1(&[1.0]));
    assert_eq!(part.values()[[0, 0, 1, 1]], 12.0);
    assert_eq!(state.time_index(7), Some(0));
    assert_eq!(state.time_index(8), None);
  }
}
