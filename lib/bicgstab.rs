//! Stabilized bi-conjugate-gradient (BiCGStab) solver over an abstract
//! linear operator.
//!
//! The quasi-inverse equations defining the effective energy-density
//! operators are solved on flattened `D × D` matrices; the operator is only
//! ever applied, never materialized, so the solver works against the
//! [`LinearOp`] trait. Solutions are warm-started from the previous step's
//! result and non-convergence is reported, not raised.

use ndarray as nd;
use num_complex::Complex64 as C64;
use num_traits::{ One, Zero };

/// An implicitly-represented square linear operator on complex vectors.
pub trait LinearOp {
    /// Vector length the operator acts on.
    fn dim(&self) -> usize;

    /// `A·x`.
    fn apply(&self, x: &nd::Array1<C64>) -> nd::Array1<C64>;
}

/// Outcome of an iterative solve.
///
/// `residual` is relative to the norm of the right-hand side.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolveReport {
    pub converged: bool,
    pub iterations: usize,
    pub residual: f64,
}

// denominator magnitudes below this mean the recurrence has broken down
const BREAKDOWN: f64 = 1e-300;

fn dotc(a: &nd::Array1<C64>, b: &nd::Array1<C64>) -> C64 {
    a.iter().zip(b.iter())
        .map(|(x, y)| x.conj() * y)
        .fold(C64::zero(), |acc, z| acc + z)
}

fn norm(a: &nd::Array1<C64>) -> f64 {
    a.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt()
}

/// Solve `A·x = b` in place, starting from the initial guess in `x`.
///
/// Terminates when the residual norm drops below `rtol·‖b‖` or after
/// `max_iter` iterations; on breakdown or iteration exhaustion the best
/// iterate reached so far is left in `x` and the report flags
/// non-convergence.
pub fn bicgstab<O>(
    op: &O,
    b: &nd::Array1<C64>,
    x: &mut nd::Array1<C64>,
    rtol: f64,
    max_iter: usize,
) -> SolveReport
where O: LinearOp + ?Sized
{
    let bnorm = norm(b);
    if bnorm == 0.0 {
        x.fill(C64::zero());
        return SolveReport { converged: true, iterations: 0, residual: 0.0 };
    }
    let tol = rtol * bnorm;

    let mut r: nd::Array1<C64> = b - &op.apply(x);
    let rhat = r.clone();
    let mut rho = C64::one();
    let mut alpha = C64::one();
    let mut omega = C64::one();
    let mut v: nd::Array1<C64> = nd::Array1::zeros(op.dim());
    let mut p: nd::Array1<C64> = nd::Array1::zeros(op.dim());

    let mut rnorm = norm(&r);
    if rnorm <= tol {
        return SolveReport {
            converged: true,
            iterations: 0,
            residual: rnorm / bnorm,
        };
    }

    for k in 0..max_iter {
        let rho_new = dotc(&rhat, &r);
        if rho_new.norm() < BREAKDOWN {
            return SolveReport {
                converged: false,
                iterations: k,
                residual: rnorm / bnorm,
            };
        }
        let beta = (rho_new / rho) * (alpha / omega);
        p = &r + &p.mapv(|pz| beta * pz) - &v.mapv(|vz| beta * omega * vz);
        v = op.apply(&p);
        let denom = dotc(&rhat, &v);
        if denom.norm() < BREAKDOWN {
            return SolveReport {
                converged: false,
                iterations: k,
                residual: rnorm / bnorm,
            };
        }
        alpha = rho_new / denom;
        let s: nd::Array1<C64> = &r - &v.mapv(|vz| alpha * vz);
        let snorm = norm(&s);
        if snorm <= tol {
            *x += &p.mapv(|pz| alpha * pz);
            return SolveReport {
                converged: true,
                iterations: k + 1,
                residual: snorm / bnorm,
            };
        }
        let t = op.apply(&s);
        let tt = dotc(&t, &t).re;
        if tt < BREAKDOWN {
            return SolveReport {
                converged: false,
                iterations: k,
                residual: snorm / bnorm,
            };
        }
        omega = dotc(&t, &s) / C64::from(tt);
        *x += &p.mapv(|pz| alpha * pz);
        *x += &s.mapv(|sz| omega * sz);
        r = &s - &t.mapv(|tz| omega * tz);
        rnorm = norm(&r);
        if rnorm <= tol {
            return SolveReport {
                converged: true,
                iterations: k + 1,
                residual: rnorm / bnorm,
            };
        }
        rho = rho_new;
    }

    SolveReport {
        converged: false,
        iterations: max_iter,
        residual: rnorm / bnorm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;
    use crate::mat;

    struct MatOp(nd::Array2<C64>);

    impl LinearOp for MatOp {
        fn dim(&self) -> usize { self.0.nrows() }

        fn apply(&self, x: &nd::Array1<C64>) -> nd::Array1<C64> {
            self.0.dot(x)
        }
    }

    #[test]
    fn solves_diagonally_dominant_system() {
        let n = 24;
        let mut rng = thread_rng();
        let mut m: nd::Array2<C64> = nd::Array2::zeros((n, n));
        mat::randomize(&mut m, (-0.5, 0.5), (-0.5, 0.5), &mut rng);
        for i in 0..n { m[[i, i]] += C64::from(n as f64); }
        let mut b: nd::Array1<C64> = nd::Array1::zeros(n);
        mat::randomize(&mut b, (-1.0, 1.0), (-1.0, 1.0), &mut rng);
        let op = MatOp(m);
        let mut x: nd::Array1<C64> = nd::Array1::zeros(n);
        let report = bicgstab(&op, &b, &mut x, 1e-12, 500);
        assert!(report.converged, "{report:?}");
        let res = mat::norm_fro(&(&op.apply(&x) - &b));
        assert!(res < 1e-9, "residual = {res:e}");
    }

    #[test]
    fn warm_start_at_solution_returns_immediately() {
        let n = 8;
        let m: nd::Array2<C64> = nd::Array2::eye(n);
        let b: nd::Array1<C64>
            = nd::Array1::from_iter((0..n).map(|i| C64::from(i as f64)));
        let op = MatOp(m);
        let mut x = b.clone();
        let report = bicgstab(&op, &b, &mut x, 1e-12, 100);
        assert!(report.converged);
        assert_eq!(report.iterations, 0);
    }

    #[test]
    fn zero_rhs_yields_zero_solution() {
        let n = 4;
        let op = MatOp(nd::Array2::eye(n));
        let b: nd::Array1<C64> = nd::Array1::zeros(n);
        let mut x: nd::Array1<C64> = nd::Array1::ones(n);
        let report = bicgstab(&op, &b, &mut x, 1e-12, 100);
        assert!(report.converged);
        assert!(x.iter().all(|z| z.norm() == 0.0));
    }
}
