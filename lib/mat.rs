//! Dense complex matrix helpers shared by the evolution engine.
//!
//! Everything here operates on `D × D` (or stacked `qD × D`) matrices of
//! [`Complex64`][num_complex::Complex64] and wraps the LAPACK-backed routines
//! from [`ndarray_linalg`] behind the handful of operations the tangent-space
//! machinery actually needs: adjoints, the Hilbert-Schmidt inner product,
//! Hermitian square roots and inverses, triangular inverses, and orthonormal
//! null-space bases.

use ndarray as nd;
use ndarray_linalg::{
    Eigh,
    SVD,
    UPLO,
    triangular::{ Diag, SolveTriangular },
};
use num_complex::Complex64 as C64;
use num_traits::Zero;
use rand::Rng;

pub type LinResult<T> = Result<T, ndarray_linalg::error::LinalgError>;

/// Conjugate transpose.
#[inline]
pub fn hconj(a: nd::ArrayView2<C64>) -> nd::Array2<C64> {
    a.t().mapv(|z| z.conj())
}

/// Hilbert-Schmidt inner product ⟨a, b⟩ = tr(a† b).
#[inline]
pub fn adot<Sa, Sb, D>(a: &nd::ArrayBase<Sa, D>, b: &nd::ArrayBase<Sb, D>)
    -> C64
where
    Sa: nd::Data<Elem = C64>,
    Sb: nd::Data<Elem = C64>,
    D: nd::Dimension,
{
    a.iter().zip(b.iter())
        .map(|(x, y)| x.conj() * y)
        .fold(C64::zero(), |acc, z| acc + z)
}

/// Frobenius norm.
#[inline]
pub fn norm_fro<S, D>(a: &nd::ArrayBase<S, D>) -> f64
where
    S: nd::Data<Elem = C64>,
    D: nd::Dimension,
{
    a.iter().map(|z| z.norm_sqr()).sum::<f64>().sqrt()
}

/// Three-factor product `a·b·c`.
#[inline]
pub fn mmul3<Sa, Sb, Sc>(
    a: &nd::ArrayBase<Sa, nd::Ix2>,
    b: &nd::ArrayBase<Sb, nd::Ix2>,
    c: &nd::ArrayBase<Sc, nd::Ix2>,
) -> nd::Array2<C64>
where
    Sa: nd::Data<Elem = C64>,
    Sb: nd::Data<Elem = C64>,
    Sc: nd::Data<Elem = C64>,
{
    a.dot(b).dot(c)
}

#[inline]
fn sample_range<R>(rng: &mut R, lo: f64, hi: f64) -> f64
where R: Rng + ?Sized
{
    if hi > lo { rng.gen_range(lo..hi) } else { lo }
}

/// Fill `a` with complex values whose real and imaginary parts are drawn
/// uniformly from `re` and `im` ranges, respectively.
#[inline]
pub fn randomize<S, D, R>(
    a: &mut nd::ArrayBase<S, D>,
    re: (f64, f64),
    im: (f64, f64),
    rng: &mut R,
)
where
    S: nd::DataMut<Elem = C64>,
    D: nd::Dimension,
    R: Rng + ?Sized,
{
    a.map_inplace(|z| {
        *z = C64::new(
            sample_range(rng, re.0, re.1),
            sample_range(rng, im.0, im.1),
        );
    });
}

/// Apply a real function to the spectrum of a Hermitian matrix given its
/// eigendecomposition: `V·f(λ)·V†`.
#[inline]
pub fn funmh<F>(ev: &nd::Array1<f64>, vecs: &nd::Array2<C64>, f: F)
    -> nd::Array2<C64>
where F: Fn(f64) -> f64
{
    let fd = nd::Array2::from_diag(&ev.mapv(|x| C64::from(f(x))));
    vecs.dot(&fd).dot(&hconj(vecs.view()))
}

/// Principal square root of a Hermitian positive-(semi)definite matrix,
/// returning the eigendecomposition for reuse (e.g. for the inverse root).
#[inline]
pub fn sqrtmh(a: &nd::Array2<C64>)
    -> LinResult<(nd::Array2<C64>, (nd::Array1<f64>, nd::Array2<C64>))>
{
    let (ev, vecs) = a.eigh(UPLO::Lower)?;
    let root = funmh(&ev, &vecs, f64::sqrt);
    Ok((root, (ev, vecs)))
}

/// Inverse of a triangular matrix.
#[inline]
pub fn invtr(a: &nd::Array2<C64>, uplo: UPLO) -> LinResult<nd::Array2<C64>> {
    let eye: nd::Array2<C64> = nd::Array2::eye(a.nrows());
    a.solve_triangular(uplo, Diag::NonUnit, &eye)
}

/// Orthonormal basis for the orthogonal complement of the column space of
/// the tall matrix `a` (`m × n`, `m ≥ n`), as the `m − n` columns of the
/// returned matrix.
///
/// The split is taken at `n` rather than at the numerical rank, so the
/// basis dimension is fixed; for rank-deficient `a` the extra columns are
/// still orthogonal to the column space.
pub fn nullspace(a: &nd::Array2<C64>) -> LinResult<nd::Array2<C64>> {
    let (_, n) = a.dim();
    let (u, _, _) = a.svd(true, false)?;
    let u = u.expect("svd: left singular vectors requested");
    Ok(u.slice(nd::s![.., n..]).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    fn random_matrix(n: usize) -> nd::Array2<C64> {
        let mut rng = thread_rng();
        let mut a = nd::Array2::zeros((n, n));
        randomize(&mut a, (-1.0, 1.0), (-1.0, 1.0), &mut rng);
        a
    }

    fn random_posdef(n: usize) -> nd::Array2<C64> {
        let a = random_matrix(n);
        let mut p = a.dot(&hconj(a.view()));
        for i in 0..n { p[[i, i]] += C64::from(0.5); }
        p
    }

    #[test]
    fn sqrtmh_squares_back() {
        let p = random_posdef(6);
        let (root, _) = sqrtmh(&p).unwrap();
        let dev = norm_fro(&(&root.dot(&root) - &p));
        assert!(dev < 1e-10, "dev = {dev:e}");
    }

    #[test]
    fn funmh_inverts() {
        let p = random_posdef(5);
        let (_, (ev, vecs)) = sqrtmh(&p).unwrap();
        let pinv = funmh(&ev, &vecs, |x| 1.0 / x);
        let eye: nd::Array2<C64> = nd::Array2::eye(5);
        let dev = norm_fro(&(&p.dot(&pinv) - &eye));
        assert!(dev < 1e-10, "dev = {dev:e}");
    }

    #[test]
    fn invtr_lower() {
        use ndarray_linalg::Cholesky;
        let p = random_posdef(5);
        let g = p.cholesky(UPLO::Lower).unwrap();
        let gi = invtr(&g, UPLO::Lower).unwrap();
        let eye: nd::Array2<C64> = nd::Array2::eye(5);
        let dev = norm_fro(&(&g.dot(&gi) - &eye));
        assert!(dev < 1e-10, "dev = {dev:e}");
    }

    #[test]
    fn nullspace_is_orthonormal_complement() {
        let mut rng = thread_rng();
        let mut a = nd::Array2::zeros((12, 4));
        randomize(&mut a, (-1.0, 1.0), (-1.0, 1.0), &mut rng);
        let ns = nullspace(&a).unwrap();
        assert_eq!(ns.dim(), (12, 8));
        let gram = hconj(ns.view()).dot(&ns);
        let eye: nd::Array2<C64> = nd::Array2::eye(8);
        assert!(norm_fro(&(&gram - &eye)) < 1e-12);
        let overlap = hconj(ns.view()).dot(&a);
        assert!(norm_fro(&overlap) < 1e-12);
    }
}
