//! Gauge choices and the canonical-form fixed-point matrix type.

use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::mat::{ self, LinResult };

/// Canonical form the engine restores after each fixed-point solve.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Gauge {
    /// `r` is the identity; `l` is diagonal with trace-normalized entries
    /// (the squared Schmidt coefficients).
    #[default]
    RightCanonical,

    /// `l` and `r` both equal the diagonal matrix of Schmidt coefficients.
    Symmetric,
}

/// A transfer-operator fixed point (`l` or `r`).
///
/// In canonical form the fixed points are diagonal with real positive
/// entries, and the gradient computation needs their square roots and
/// inverses many times per step; the `Diagonal` variant makes those
/// operations trivial. Outside canonical form (between a fixed-point solve
/// and the gauge restore, or right after loading a state) the matrix is held
/// `Dense`. The variant is resolved once, at gauge-fixing time.
#[derive(Clone, Debug, PartialEq)]
pub enum FixedPoint {
    Diagonal(nd::Array1<f64>),
    Dense(nd::Array2<C64>),
}

impl FixedPoint {
    /// The identity matrix.
    pub fn identity(dim: usize) -> Self {
        Self::Diagonal(nd::Array1::ones(dim))
    }

    pub fn dim(&self) -> usize {
        match self {
            Self::Diagonal(v) => v.len(),
            Self::Dense(m) => m.nrows(),
        }
    }

    pub fn to_dense(&self) -> nd::Array2<C64> {
        match self {
            Self::Diagonal(v) => nd::Array2::from_diag(&v.mapv(C64::from)),
            Self::Dense(m) => m.clone(),
        }
    }

    /// Principal square root.
    ///
    /// The `Dense` branch eigendecomposes, so it assumes hermiticity and
    /// positive semi-definiteness (guaranteed for transfer-operator fixed
    /// points up to solver tolerance).
    pub fn sqrt(&self) -> LinResult<Self> {
        match self {
            Self::Diagonal(v) => Ok(Self::Diagonal(v.mapv(f64::sqrt))),
            Self::Dense(m) => {
                let (root, _) = mat::sqrtmh(m)?;
                Ok(Self::Dense(root))
            },
        }
    }

    /// Inverse, by the same Hermitian eigendecomposition route.
    pub fn inv(&self) -> LinResult<Self> {
        match self {
            Self::Diagonal(v) => Ok(Self::Diagonal(v.mapv(|x| 1.0 / x))),
            Self::Dense(m) => {
                let (_, (ev, vecs)) = mat::sqrtmh(m)?;
                Ok(Self::Dense(mat::funmh(&ev, &vecs, |x| 1.0 / x)))
            },
        }
    }

    /// `self · x`.
    pub fn lmul(&self, x: &nd::Array2<C64>) -> nd::Array2<C64> {
        match self {
            Self::Diagonal(v) => {
                let mut out = x.clone();
                for (vi, mut row) in v.iter().zip(out.outer_iter_mut()) {
                    row.mapv_inplace(|z| z * vi);
                }
                out
            },
            Self::Dense(m) => m.dot(x),
        }
    }

    /// `x · self`.
    pub fn rmul(&self, x: &nd::Array2<C64>) -> nd::Array2<C64> {
        match self {
            Self::Diagonal(v) => {
                let mut out = x.clone();
                for (vj, mut col) in v.iter().zip(out.columns_mut()) {
                    col.mapv_inplace(|z| z * vj);
                }
                out
            },
            Self::Dense(m) => x.dot(m),
        }
    }

    /// `tr(self† x)`.
    pub fn adot(&self, x: &nd::Array2<C64>) -> C64 {
        match self {
            Self::Diagonal(v) => {
                v.iter().zip(x.diag())
                    .map(|(vi, xi)| xi * vi)
                    .fold(C64::new(0.0, 0.0), |acc, z| acc + z)
            },
            Self::Dense(m) => mat::adot(m, x),
        }
    }
}

/// Von Neumann entanglement entropy −Σ λ log₂ λ over squared Schmidt
/// coefficients, skipping non-positive entries.
pub fn entropy(weights: &nd::Array1<f64>) -> f64 {
    weights.iter()
        .filter(|lam| **lam > 0.0)
        .map(|lam| -lam * lam.log2())
        .sum()
}
