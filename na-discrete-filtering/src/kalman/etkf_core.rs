//! The ensemble-space analysis transform.
//!
//! Inputs are observation-space quantities already whitened by the
//! observation error covariance: perturbations `P` `(ensemble, obs)` and
//! the innovation `d` `(obs)`. With `K = P P^T`, `gamma = (n - 1) / f` and
//! `K = V diag(lambda) V^T`:
//!
//! ```text
//! P_a     = V diag(1 / (lambda + gamma)) V^T
//! W_perts = V diag(sqrt((n - 1) / (lambda + gamma))) V^T
//! w_mean  = P_a P d
//! W       = w_mean 1^T + W_perts
//! ```

use nd::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, ArrayViewD, Axis, IxDyn};

use nla_factorize::{decompose, reconstruct};

use na_core::{Error, Result};

/// Multiplicative inflation of the analysis spread. A batched factor
/// broadcasts against the batch shape of the problem.
#[derive(Debug, Clone, PartialEq)]
pub enum InflationFactor {
  Scalar(f64),
  Batched(ArrayD<f64>),
}

impl Default for InflationFactor {
  fn default() -> InflationFactor { InflationFactor::Scalar(1.0) }
}
impl From<f64> for InflationFactor {
  fn from(v: f64) -> InflationFactor { InflationFactor::Scalar(v) }
}
impl From<Array1<f64>> for InflationFactor {
  fn from(v: Array1<f64>) -> InflationFactor { InflationFactor::Batched(v.into_dyn()) }
}
impl From<ArrayD<f64>> for InflationFactor {
  fn from(v: ArrayD<f64>) -> InflationFactor { InflationFactor::Batched(v) }
}

impl InflationFactor {
  /// The factor as an array of the given batch shape.
  pub fn to_array(&self, batch_shape: &[usize]) -> Result<ArrayD<f64>> {
    let out = match self {
      InflationFactor::Scalar(v) => ArrayD::from_elem(IxDyn(batch_shape), *v),
      InflationFactor::Batched(v) => {
        v.broadcast(IxDyn(batch_shape))
          .ok_or_else(|| {
            Error::Validation(format!("inflation factor of shape {:?} does not broadcast to {:?}",
                                      v.shape(), batch_shape))
          })?
          .to_owned()
      },
    };
    if out.iter().any(|&f| !(f > 0.0) || !f.is_finite()) {
      return Err(Error::configuration("inflation factors must be positive and finite"));
    }
    Ok(out)
  }

  /// The factor of a single problem; a batched factor must hold exactly
  /// one value.
  pub fn scalar(&self) -> Result<f64> {
    let f = match self {
      InflationFactor::Scalar(v) => *v,
      InflationFactor::Batched(v) if v.len() == 1 => v.iter().cloned().sum(),
      InflationFactor::Batched(v) => {
        return Err(Error::Validation(format!("inflation factor of shape {:?} for a single problem",
                                             v.shape())));
      },
    };
    if !(f > 0.0) || !f.is_finite() {
      return Err(Error::configuration("inflation factors must be positive and finite"));
    }
    Ok(f)
  }
}

/// The analysis transform of one problem.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
  /// `(ensemble)`
  pub w_mean: Array1<f64>,
  /// `(ensemble, ensemble)`
  pub w_perts: Array2<f64>,
  /// `w_mean` added to every column of `w_perts`.
  pub weights: Array2<f64>,
  /// Posterior covariance in ensemble space.
  pub cov: Array2<f64>,
}

/// Stacked transforms, batch dimensions leading.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchedTransform {
  pub w_mean: ArrayD<f64>,
  pub w_perts: ArrayD<f64>,
  pub weights: ArrayD<f64>,
  pub cov: ArrayD<f64>,
}

/// Gradient of a scalar loss with respect to the engine inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformGrad {
  pub perts: Array2<f64>,
  pub innov: Array1<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EtkfWeights {
  inf_factor: InflationFactor,
}

impl EtkfWeights {
  pub fn new<F: Into<InflationFactor>>(inf_factor: F) -> EtkfWeights {
    EtkfWeights {
      inf_factor: inf_factor.into(),
    }
  }

  pub fn inf_factor(&self) -> &InflationFactor { &self.inf_factor }
  pub fn set_inf_factor<F: Into<InflationFactor>>(&mut self, inf_factor: F) {
    self.inf_factor = inf_factor.into();
  }

  pub fn compute(&self, perts: ArrayView2<f64>, innov: ArrayView1<f64>) -> Result<Transform> {
    check_single(perts, innov)?;
    let f = self.inf_factor.scalar()?;
    transform(perts, innov, f)
  }

  /// `perts` is `(..., ensemble, obs)` and `innov` `(..., obs)`; every
  /// leading index is an independent problem, solved exactly as `compute`
  /// would solve it.
  pub fn compute_batched(&self, perts: ArrayViewD<f64>,
                         innov: ArrayViewD<f64>) -> Result<BatchedTransform> {
    let (batch_shape, n, m) = check_batched(perts.view(), innov.view())?;
    let factors = self.inf_factor.to_array(&batch_shape)?;
    let b: usize = batch_shape.iter().product();

    let flat_perts = perts
      .to_shape((b, n, m))
      .map_err(|e| Error::Validation(e.to_string()))?;
    let flat_innov = innov
      .to_shape((b, m))
      .map_err(|e| Error::Validation(e.to_string()))?;

    let mut w_mean = nd::Array2::zeros((b, n));
    let mut w_perts = nd::Array3::zeros((b, n, n));
    let mut weights = nd::Array3::zeros((b, n, n));
    let mut cov = nd::Array3::zeros((b, n, n));
    for (i, ((p, d), &f)) in flat_perts.outer_iter()
      .zip(flat_innov.outer_iter())
      .zip(factors.iter())
      .enumerate()
    {
      let t = transform(p, d, f)?;
      w_mean.row_mut(i).assign(&t.w_mean);
      w_perts.index_axis_mut(Axis(0), i).assign(&t.w_perts);
      weights.index_axis_mut(Axis(0), i).assign(&t.weights);
      cov.index_axis_mut(Axis(0), i).assign(&t.cov);
    }

    let mut vec_shape = batch_shape.clone();
    vec_shape.push(n);
    let mut mat_shape = vec_shape.clone();
    mat_shape.push(n);
    Ok(BatchedTransform {
      w_mean: reshape(w_mean.into_dyn(), &vec_shape)?,
      w_perts: reshape(w_perts.into_dyn(), &mat_shape)?,
      weights: reshape(weights.into_dyn(), &mat_shape)?,
      cov: reshape(cov.into_dyn(), &mat_shape)?,
    })
  }

  /// Reverse-mode gradient: given the cotangents of every output of
  /// `compute` (laid out as a `Transform`), returns the gradient with
  /// respect to `perts` and `innov`.
  ///
  /// The kernel enters through `P_a = g1(A)` and `W_perts = g2(A)` with
  /// `A = K + gamma I`; their adjoints use the Daleckii-Krein formula
  /// `dL/dA = V (F o V^T G V) V^T`, where `F` holds the divided
  /// differences of `g` at the eigenvalues of `A`.
  pub fn backward(&self, perts: ArrayView2<f64>,
                  innov: ArrayView1<f64>,
                  cotangent: &Transform) -> Result<TransformGrad> {
    check_single(perts, innov)?;
    let (n, m) = perts.dim();
    for &(what, shape) in [("w_perts", cotangent.w_perts.dim()),
                           ("weights", cotangent.weights.dim()),
                           ("cov", cotangent.cov.dim())].iter() {
      if shape != (n, n) {
        return Err(Error::Validation(format!("cotangent of {} has shape {:?}, expected {:?}",
                                             what, shape, (n, n))));
      }
    }
    if cotangent.w_mean.len() != n {
      return Err(Error::Validation(format!("cotangent of w_mean has length {}, expected {}",
                                           cotangent.w_mean.len(), n)));
    }

    let mut grad = TransformGrad {
      perts: Array2::zeros((n, m)),
      innov: Array1::zeros(m),
    };
    // the prior branch does not depend on the inputs
    if m == 0 {
      return Ok(grad);
    }

    let f = self.inf_factor.scalar()?;
    let n1 = (n - 1) as f64;
    let kernel = perts.dot(&perts.t());
    let dec = decompose(&kernel, n1 / f)?;
    let mu = dec.inv_values.mapv(f64::recip);
    let v = dec.vectors;
    let cov = reconstruct(&dec.inv_values, &v)?;
    let u = perts.dot(&innov);

    let g_wm = &cotangent.w_mean + &cotangent.weights.sum_axis(Axis(1));
    let g_wperts = &cotangent.w_perts + &cotangent.weights;
    let mut g_cov = cotangent.cov.clone();
    // w_mean = cov u
    g_cov += &outer(g_wm.view(), u.view());
    let g_u = cov.dot(&g_wm);
    // u = P d
    grad.perts += &outer(g_u.view(), innov);
    grad.innov = perts.t().dot(&g_u);

    let sqrt_mu = mu.mapv(f64::sqrt);
    let d_cov = Array2::from_shape_fn((n, n), |(i, j)| -1.0 / (mu[i] * mu[j]));
    let d_wperts = Array2::from_shape_fn((n, n), |(i, j)| {
      -n1.sqrt() / (sqrt_mu[i] * sqrt_mu[j] * (sqrt_mu[i] + sqrt_mu[j]))
    });
    let g_a = matrix_fn_adjoint(&v, &d_cov, &g_cov) + matrix_fn_adjoint(&v, &d_wperts, &g_wperts);

    // A = P P^T + gamma I
    let g_sym = &g_a + &g_a.t();
    grad.perts += &g_sym.dot(&perts);

    Ok(grad)
  }
}

fn transform(perts: ArrayView2<f64>, innov: ArrayView1<f64>, f: f64) -> Result<Transform> {
  let (n, m) = perts.dim();
  let n1 = (n - 1) as f64;

  if m == 0 {
    let w_perts = Array2::eye(n) * f.sqrt();
    return Ok(Transform {
      w_mean: Array1::zeros(n),
      weights: w_perts.clone(),
      w_perts,
      cov: Array2::eye(n) * (f / n1),
    });
  }

  let kernel = perts.dot(&perts.t());
  let dec = decompose(&kernel, n1 / f)?;
  let cov = reconstruct(&dec.inv_values, &dec.vectors)?;
  let w_perts = reconstruct(&dec.inv_values.mapv(|v| (n1 * v).sqrt()), &dec.vectors)?;
  let w_mean = cov.dot(&perts.dot(&innov));
  let weights = &w_perts + &w_mean.view().insert_axis(Axis(1));

  Ok(Transform {
    w_mean,
    w_perts,
    weights,
    cov,
  })
}

fn matrix_fn_adjoint(v: &Array2<f64>, divided: &Array2<f64>, g: &Array2<f64>) -> Array2<f64> {
  let inner = v.t().dot(g).dot(v) * divided;
  v.dot(&inner).dot(&v.t())
}

fn outer(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Array2<f64> {
  a.insert_axis(Axis(1)).dot(&b.insert_axis(Axis(0)))
}

fn check_single(perts: ArrayView2<f64>, innov: ArrayView1<f64>) -> Result<()> {
  let (n, m) = perts.dim();
  if n < 2 {
    return Err(Error::Validation(format!("an ensemble needs at least two members, got {}", n)));
  }
  if innov.len() != m {
    return Err(Error::Validation(format!("perturbations have {} observations, the innovation {}",
                                         m, innov.len())));
  }
  if perts.iter().chain(innov.iter()).any(|v| !v.is_finite()) {
    return Err(Error::Numerical("non-finite perturbations or innovation".into()));
  }
  Ok(())
}

fn check_batched(perts: ArrayViewD<f64>,
                 innov: ArrayViewD<f64>) -> Result<(Vec<usize>, usize, usize)> {
  let p_shape = perts.shape();
  let d_shape = innov.shape();
  if p_shape.len() < 2 {
    return Err(Error::Validation(format!("perturbations of shape {:?} lack an ensemble axis",
                                         p_shape)));
  }
  let nd = p_shape.len();
  let (n, m) = (p_shape[nd - 2], p_shape[nd - 1]);
  if d_shape.len() != nd - 1 {
    return Err(Error::Validation(format!("innovation of shape {:?} for perturbations of shape {:?}",
                                         d_shape, p_shape)));
  }
  if d_shape[nd - 2] != m {
    return Err(Error::Validation(format!("perturbations have {} observations, the innovation {}",
                                         m, d_shape[nd - 2])));
  }
  if p_shape[..nd - 2] != d_shape[..nd - 2] {
    return Err(Error::Validation(format!("batch shapes {:?} and {:?} differ",
                                         &p_shape[..nd - 2], &d_shape[..nd - 2])));
  }
  if n < 2 {
    return Err(Error::Validation(format!("an ensemble needs at least two members, got {}", n)));
  }
  if perts.iter().chain(innov.iter()).any(|v| !v.is_finite()) {
    return Err(Error::Numerical("non-finite perturbations or innovation".into()));
  }
  Ok((p_shape[..nd - 2].to_vec(), n, m))
}

fn reshape(a: ArrayD<f64>, shape: &[usize]) -> Result<ArrayD<f64>> {
  a.into_shape_with_order(IxDyn(shape))
    .map_err(|e| Error::Validation(e.to_string()))
}
