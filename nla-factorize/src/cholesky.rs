use nd::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2, NdFloat};

use crate::error::{FactorizeError, Result};

pub trait Cholesky {
  type Elem;
  /// Returns the upper triangular factor, R, of A = R^*R.
  fn l_lstar(&self) -> Result<Array2<Self::Elem>>;
}

impl<S, A> Cholesky for ArrayBase<S, Ix2>
  where S: Data<Elem = A>,
        A: NdFloat,
{
  type Elem = A;

  fn l_lstar(&self) -> Result<Array2<A>> {
    let m = check_square(self)?;
    if self.iter().any(|v| !v.is_finite()) {
      return Err(FactorizeError::NonFinite);
    }

    let mut r = self.to_owned();

    for k in 0..m {
      let pivot = r[[k, k]];
      if !(pivot > A::zero()) {
        return Err(FactorizeError::NotPositiveDefinite { pivot: k });
      }

      for j in k + 1..m {
        let factor = r[[k, j]] / pivot;
        if factor == A::zero() { continue; }

        let (head, mut tail) = r.view_mut().split_at(Axis(0), j);
        tail.row_mut(0)
          .slice_mut(s![j..])
          .scaled_add(-factor, &head.row(k).slice(s![j..]));
      }

      let t = pivot.sqrt().recip();
      r.row_mut(k)
        .slice_mut(s![k..])
        .mapv_inplace(|v| v * t);
    }

    for k in 0..m {
      r.row_mut(k)
        .slice_mut(s![..k])
        .fill(A::zero());
    }

    Ok(r)
  }
}

fn check_square<S, A>(a: &ArrayBase<S, Ix2>) -> Result<usize>
  where S: Data<Elem = A>,
{
  let (rows, cols) = a.dim();
  if rows != cols {
    Err(FactorizeError::NotSquare { rows, cols })
  } else {
    Ok(rows)
  }
}

fn check_factor<S, A>(r: &ArrayBase<S, Ix2>, rhs_rows: usize) -> Result<usize>
  where S: Data<Elem = A>,
        A: NdFloat,
{
  let n = check_square(r)?;
  if rhs_rows != n {
    return Err(FactorizeError::DimensionMismatch {
      expected: n,
      found: rhs_rows,
    });
  }
  if let Some(pivot) = (0..n).find(|&i| r[[i, i]] == A::zero()) {
    return Err(FactorizeError::NotPositiveDefinite { pivot });
  }
  Ok(n)
}

/// Solves R^* Y = B, where R is the upper factor returned by `l_lstar`.
pub fn forward_substitute_lstar<S1, S2, A>(r: &ArrayBase<S1, Ix2>,
                                           b: &ArrayBase<S2, Ix2>)
  -> Result<Array2<A>>
  where S1: Data<Elem = A>,
        S2: Data<Elem = A>,
        A: NdFloat,
{
  let n = check_factor(r, b.nrows())?;
  let mut y = b.to_owned();

  for i in 0..n {
    for j in 0..i {
      let f = r[[j, i]];
      if f == A::zero() { continue; }

      let (head, mut tail) = y.view_mut().split_at(Axis(0), i);
      tail.row_mut(0)
        .scaled_add(-f, &head.row(j));
    }
    let d = r[[i, i]];
    y.row_mut(i).mapv_inplace(|v| v / d);
  }

  Ok(y)
}

/// Solves R X = Y by back substitution.
pub fn back_substitute<S1, S2, A>(r: &ArrayBase<S1, Ix2>,
                                  y: &ArrayBase<S2, Ix2>)
  -> Result<Array2<A>>
  where S1: Data<Elem = A>,
        S2: Data<Elem = A>,
        A: NdFloat,
{
  let n = check_factor(r, y.nrows())?;
  let mut x = y.to_owned();

  for i in (0..n).rev() {
    for j in i + 1..n {
      let f = r[[i, j]];
      if f == A::zero() { continue; }

      let (mut head, tail) = x.view_mut().split_at(Axis(0), i + 1);
      head.row_mut(i)
        .scaled_add(-f, &tail.row(j - i - 1));
    }
    let d = r[[i, i]];
    x.row_mut(i).mapv_inplace(|v| v / d);
  }

  Ok(x)
}

/// Solves A X = B for a symmetric positive definite A.
pub fn cholesky_solve<S1, S2, A>(a: &ArrayBase<S1, Ix2>,
                                 b: &ArrayBase<S2, Ix2>)
  -> Result<Array2<A>>
  where S1: Data<Elem = A>,
        S2: Data<Elem = A>,
        A: NdFloat,
{
  let r = a.l_lstar()?;
  let y = forward_substitute_lstar(&r, b)?;
  back_substitute(&r, &y)
}

pub fn cholesky_solve_vec<S1, S2, A>(a: &ArrayBase<S1, Ix2>,
                                     b: &ArrayBase<S2, Ix1>)
  -> Result<Array1<A>>
  where S1: Data<Elem = A>,
        S2: Data<Elem = A>,
        A: NdFloat,
{
  let b2 = b.view().insert_axis(Axis(1));
  let x = cholesky_solve(a, &b2)?;
  Ok(x.index_axis_move(Axis(1), 0))
}
