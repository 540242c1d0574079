//! Distance-based observation localization.
//!
//! A localization returns, for one target grid point, which observations
//! to use and with which weight. Weights lie in `[0, 1]` and are zero at
//! and beyond the localization radius.

use nd::{Array1, ArrayView1, ArrayView2};

use crate::{Error, Result};

pub trait Localization: Send + Sync {
  fn localize_obs(&self,
                  grid_point: ArrayView1<f64>,
                  obs_grid: ArrayView2<f64>) -> Result<(Array1<bool>, Array1<f64>)>;
}

fn euclidean(grid_point: ArrayView1<f64>, obs_grid: ArrayView2<f64>) -> Result<Array1<f64>> {
  if grid_point.len() != obs_grid.ncols() {
    return Err(Error::Validation(format!("grid point has {} coordinates, observations have {}",
                                         grid_point.len(), obs_grid.ncols())));
  }
  Ok(obs_grid.outer_iter()
     .map(|obs| {
       obs.iter()
         .zip(grid_point.iter())
         .map(|(o, g)| (o - g) * (o - g))
         .sum::<f64>()
         .sqrt()
     })
     .collect())
}

fn weights_by<F>(grid_point: ArrayView1<f64>,
                 obs_grid: ArrayView2<f64>,
                 radius: f64,
                 f: F) -> Result<(Array1<bool>, Array1<f64>)>
  where F: Fn(f64) -> f64,
{
  let weights = euclidean(grid_point, obs_grid)?
    .mapv_into(|d| if d < radius { f(d).max(0.0).min(1.0) } else { 0.0 });
  let use_obs = weights.mapv(|w| w > 0.0);
  Ok((use_obs, weights))
}

fn check_radius(radius: f64) -> Result<()> {
  if radius > 0.0 && radius.is_finite() {
    Ok(())
  } else {
    Err(Error::Configuration(format!("localization radius must be positive, got {}", radius)))
  }
}

/// Full weight strictly inside the radius, nothing outside.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxCar {
  radius: f64,
}
impl BoxCar {
  pub fn new(radius: f64) -> Result<BoxCar> {
    check_radius(radius)?;
    Ok(BoxCar { radius })
  }
  pub fn radius(&self) -> f64 { self.radius }
}
impl Localization for BoxCar {
  fn localize_obs(&self, grid_point: ArrayView1<f64>,
                  obs_grid: ArrayView2<f64>) -> Result<(Array1<bool>, Array1<f64>)> {
    weights_by(grid_point, obs_grid, self.radius, |_| 1.0)
  }
}

/// Gaspari & Cohn (1999), eq. 4.10, with compact support at `radius`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaspariCohn {
  radius: f64,
}
impl GaspariCohn {
  pub fn new(radius: f64) -> Result<GaspariCohn> {
    check_radius(radius)?;
    Ok(GaspariCohn { radius })
  }
  pub fn radius(&self) -> f64 { self.radius }

  pub fn correlation(&self, distance: f64) -> f64 {
    let r = 2.0 * distance.abs() / self.radius;
    if r <= 1.0 {
      (((-0.25 * r + 0.5) * r + 0.625) * r - 5.0 / 3.0) * r * r + 1.0
    } else if r < 2.0 {
      ((((r / 12.0 - 0.5) * r + 0.625) * r + 5.0 / 3.0) * r - 5.0) * r + 4.0
        - 2.0 / (3.0 * r)
    } else {
      0.0
    }
  }
}
impl Localization for GaspariCohn {
  fn localize_obs(&self, grid_point: ArrayView1<f64>,
                  obs_grid: ArrayView2<f64>) -> Result<(Array1<bool>, Array1<f64>)> {
    weights_by(grid_point, obs_grid, self.radius, |d| self.correlation(d))
  }
}

/// `exp(-d^2 / (2 l^2))`, truncated at `radius`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gaussian {
  length_scale: f64,
  radius: f64,
}
impl Gaussian {
  pub fn new(length_scale: f64, radius: f64) -> Result<Gaussian> {
    check_radius(radius)?;
    if !(length_scale > 0.0 && length_scale.is_finite()) {
      return Err(Error::Configuration(format!("length scale must be positive, got {}",
                                              length_scale)));
    }
    Ok(Gaussian { length_scale, radius })
  }
}
impl Localization for Gaussian {
  fn localize_obs(&self, grid_point: ArrayView1<f64>,
                  obs_grid: ArrayView2<f64>) -> Result<(Array1<bool>, Array1<f64>)> {
    let l2 = self.length_scale * self.length_scale;
    weights_by(grid_point, obs_grid, self.radius, |d| (-0.5 * d * d / l2).exp())
  }
}
