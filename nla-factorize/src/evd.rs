//! Symmetric eigendecomposition by cyclic Jacobi rotations.
//!
//! The kernels decomposed here are small (ensemble size squared), so the
//! plain Jacobi method is both accurate enough and cheap. Keeping it in
//! Rust means the workspace builds without a system LAPACK, and the
//! eigenvector order and signs do not depend on which LAPACK is linked.
//!
//! Every matrix, batched or not, goes through `symmetric_eigen`; stacking
//! the results of single calls reproduces a batched call bit for bit.

use nd::{Array1, Array2, ArrayBase, ArrayD, Axis, Data, Dimension, Ix1, Ix2,
         IxDyn, NdFloat};

use std::cmp::Ordering;

use crate::error::{FactorizeError, Result};

const MAX_SWEEPS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition<A> {
  /// Ascending.
  pub values: Array1<A>,
  /// Orthonormal, one eigenvector per column.
  pub vectors: Array2<A>,
  /// `1 / (values + reg_value)`
  pub inv_values: Array1<A>,
}
impl<A> Decomposition<A> {
  pub fn into_parts(self) -> (Array1<A>, Array2<A>, Array1<A>) {
    (self.values, self.vectors, self.inv_values)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchedDecomposition<A> {
  pub values: ArrayD<A>,
  pub vectors: ArrayD<A>,
  pub inv_values: ArrayD<A>,
}

pub fn decompose<S, A>(kernel: &ArrayBase<S, Ix2>, reg_value: A)
  -> Result<Decomposition<A>>
  where S: Data<Elem = A>,
        A: NdFloat,
{
  let (values, vectors) = symmetric_eigen(kernel)?;
  let inv_values = values.mapv(|v| (v + reg_value).recip());
  Ok(Decomposition {
    values,
    vectors,
    inv_values,
  })
}

/// `kernels` has shape `(..., n, n)`; every leading index is an
/// independent problem.
pub fn decompose_batched<S, A, D>(kernels: &ArrayBase<S, D>, reg_value: A)
  -> Result<BatchedDecomposition<A>>
  where S: Data<Elem = A>,
        A: NdFloat,
        D: Dimension,
{
  let (batch_shape, n) = batch_square_shape(kernels.shape())?;
  let b: usize = batch_shape.iter().product();
  let flat = kernels
    .to_shape((b, n, n))
    .map_err(|_| FactorizeError::DimensionMismatch { expected: b * n * n, found: kernels.len() })?;

  let mut values = Array2::zeros((b, n));
  let mut vectors = nd::Array3::zeros((b, n, n));
  let mut inv_values = Array2::zeros((b, n));
  for (i, kernel) in flat.outer_iter().enumerate() {
    let d = decompose(&kernel, reg_value)?;
    values.row_mut(i).assign(&d.values);
    vectors.index_axis_mut(Axis(0), i).assign(&d.vectors);
    inv_values.row_mut(i).assign(&d.inv_values);
  }

  let mut vec_shape = batch_shape.clone();
  vec_shape.push(n);
  let mut mat_shape = vec_shape.clone();
  mat_shape.push(n);

  Ok(BatchedDecomposition {
    values: reshape_dyn(values, &vec_shape)?,
    vectors: reshape_dyn(vectors, &mat_shape)?,
    inv_values: reshape_dyn(inv_values, &vec_shape)?,
  })
}

/// Rebuilds `V diag(values) V^T`.
pub fn reconstruct<S1, S2, A>(values: &ArrayBase<S1, Ix1>,
                              vectors: &ArrayBase<S2, Ix2>)
  -> Result<Array2<A>>
  where S1: Data<Elem = A>,
        S2: Data<Elem = A>,
        A: NdFloat,
{
  reconstruct_with(values, vectors, vectors)
}

/// Rebuilds `V_left diag(values) V_right^T`.
pub fn reconstruct_with<S1, S2, S3, A>(values: &ArrayBase<S1, Ix1>,
                                       left: &ArrayBase<S2, Ix2>,
                                       right: &ArrayBase<S3, Ix2>)
  -> Result<Array2<A>>
  where S1: Data<Elem = A>,
        S2: Data<Elem = A>,
        S3: Data<Elem = A>,
        A: NdFloat,
{
  let k = values.len();
  for found in [left.ncols(), right.ncols()].iter().cloned() {
    if found != k {
      return Err(FactorizeError::DimensionMismatch { expected: k, found });
    }
  }

  let mut scaled = left.to_owned();
  scaled *= values;
  Ok(scaled.dot(&right.t()))
}

/// `values` has shape `(..., k)` and `vectors` `(..., n, k)`.
pub fn reconstruct_batched<S1, S2, A, D1, D2>(values: &ArrayBase<S1, D1>,
                                              vectors: &ArrayBase<S2, D2>)
  -> Result<ArrayD<A>>
  where S1: Data<Elem = A>,
        S2: Data<Elem = A>,
        A: NdFloat,
        D1: Dimension,
        D2: Dimension,
{
  let vec_shape = vectors.shape();
  if vec_shape.len() < 2 || values.ndim() + 1 != vec_shape.len() {
    return Err(FactorizeError::DimensionMismatch {
      expected: vec_shape.len().saturating_sub(1),
      found: values.ndim(),
    });
  }
  let nd = vec_shape.len();
  let (n, k) = (vec_shape[nd - 2], vec_shape[nd - 1]);
  let batch_shape = vec_shape[..nd - 2].to_vec();
  if values.shape()[..nd - 2] != batch_shape[..] || values.shape()[nd - 2] != k {
    return Err(FactorizeError::DimensionMismatch {
      expected: k,
      found: values.shape()[nd - 2],
    });
  }

  let b: usize = batch_shape.iter().product();
  let flat_values = values
    .to_shape((b, k))
    .map_err(|_| FactorizeError::DimensionMismatch { expected: b * k, found: values.len() })?;
  let flat_vectors = vectors
    .to_shape((b, n, k))
    .map_err(|_| FactorizeError::DimensionMismatch { expected: b * n * k, found: vectors.len() })?;

  let mut out = nd::Array3::zeros((b, n, n));
  for (i, (vals, vecs)) in flat_values.outer_iter().zip(flat_vectors.outer_iter()).enumerate() {
    out.index_axis_mut(Axis(0), i)
      .assign(&reconstruct(&vals, &vecs)?);
  }

  let mut out_shape = batch_shape;
  out_shape.push(n);
  out_shape.push(n);
  reshape_dyn(out, &out_shape)
}

/// Eigenvalues in ascending order and their orthonormal eigenvectors.
/// The input is symmetrized before the sweeps start.
pub fn symmetric_eigen<S, A>(a: &ArrayBase<S, Ix2>) -> Result<(Array1<A>, Array2<A>)>
  where S: Data<Elem = A>,
        A: NdFloat,
{
  let (rows, cols) = a.dim();
  if rows != cols {
    return Err(FactorizeError::NotSquare { rows, cols });
  }
  if a.iter().any(|v| !v.is_finite()) {
    return Err(FactorizeError::NonFinite);
  }

  let n = rows;
  let two = A::one() + A::one();
  let mut w = Array2::from_shape_fn((n, n), |(i, j)| (a[[i, j]] + a[[j, i]]) / two);
  let mut v = Array2::eye(n);

  let norm = frobenius(&w);
  let tiny = norm * A::epsilon() * A::epsilon();
  let hundred = <A as num_traits::NumCast>::from(100.0).unwrap_or_else(A::one);

  let mut converged = false;
  for sweep in 0..MAX_SWEEPS {
    if off_diagonal(&w) <= tiny {
      converged = true;
      break;
    }

    for p in 0..n {
      for q in p + 1..n {
        let apq = w[[p, q]];
        if apq == A::zero() { continue; }

        let g = hundred * apq.abs();
        let (app, aqq) = (w[[p, p]], w[[q, q]]);
        if sweep > 3 && app.abs() + g == app.abs() && aqq.abs() + g == aqq.abs() {
          w[[p, q]] = A::zero();
          w[[q, p]] = A::zero();
          continue;
        }

        rotate(&mut w, &mut v, p, q);
      }
    }
  }
  if !converged && off_diagonal(&w) > tiny {
    return Err(FactorizeError::NoConvergence { sweeps: MAX_SWEEPS });
  }

  let diag = w.diag().to_owned();
  let mut order: Vec<usize> = (0..n).collect();
  order.sort_by(|&i, &j| diag[i].partial_cmp(&diag[j]).unwrap_or(Ordering::Equal));

  let values = order.iter().map(|&i| diag[i]).collect::<Array1<A>>();
  let vectors = v.select(Axis(1), &order);
  Ok((values, vectors))
}

/// Zeroes `w[p, q]` with the rotation `w <- J^T w J` and accumulates `J`
/// into `v`.
fn rotate<A>(w: &mut Array2<A>, v: &mut Array2<A>, p: usize, q: usize)
  where A: NdFloat,
{
  let n = w.nrows();
  let two = A::one() + A::one();
  let apq = w[[p, q]];
  let theta = (w[[q, q]] - w[[p, p]]) / (two * apq);

  let t = if theta.abs() > A::max_value().sqrt() {
    (two * theta).recip()
  } else {
    let sign = if theta < A::zero() { -A::one() } else { A::one() };
    sign / (theta.abs() + (theta * theta + A::one()).sqrt())
  };
  let c = (t * t + A::one()).sqrt().recip();
  let s = t * c;

  for k in 0..n {
    let (akp, akq) = (w[[k, p]], w[[k, q]]);
    w[[k, p]] = c * akp - s * akq;
    w[[k, q]] = s * akp + c * akq;
  }
  for k in 0..n {
    let (apk, aqk) = (w[[p, k]], w[[q, k]]);
    w[[p, k]] = c * apk - s * aqk;
    w[[q, k]] = s * apk + c * aqk;
  }
  w[[p, q]] = A::zero();
  w[[q, p]] = A::zero();

  for k in 0..n {
    let (vkp, vkq) = (v[[k, p]], v[[k, q]]);
    v[[k, p]] = c * vkp - s * vkq;
    v[[k, q]] = s * vkp + c * vkq;
  }
}

fn frobenius<A>(w: &Array2<A>) -> A
  where A: NdFloat,
{
  w.iter().fold(A::zero(), |acc, &x| acc + x * x).sqrt()
}

fn off_diagonal<A>(w: &Array2<A>) -> A
  where A: NdFloat,
{
  let mut acc = A::zero();
  for ((i, j), &x) in w.indexed_iter() {
    if i != j {
      acc = acc + x * x;
    }
  }
  acc.sqrt()
}

fn batch_square_shape(shape: &[usize]) -> Result<(Vec<usize>, usize)> {
  let nd = shape.len();
  if nd < 2 {
    return Err(FactorizeError::DimensionMismatch { expected: 2, found: nd });
  }
  let (rows, cols) = (shape[nd - 2], shape[nd - 1]);
  if rows != cols {
    return Err(FactorizeError::NotSquare { rows, cols });
  }
  Ok((shape[..nd - 2].to_vec(), rows))
}

fn reshape_dyn<A, D>(a: nd::Array<A, D>, shape: &[usize]) -> Result<ArrayD<A>>
  where D: Dimension,
{
  let len = a.len();
  a.into_dyn()
    .into_shape_with_order(IxDyn(shape))
    .map_err(|_| FactorizeError::DimensionMismatch {
      expected: shape.iter().product(),
      found: len,
    })
}
