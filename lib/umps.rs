//! Tangent-space evolution engine for uniform matrix product states.
//!
//! A uniform MPS describes an infinite, translation-invariant spin chain by a
//! single repeating site tensor `A`: an ordered collection of `q` complex
//! `D × D` matrices, where `q` is the local physical dimension and `D` the
//! bond dimension. The engine owns `A` together with the derived quantities
//! needed by the time-dependent variational principle (TDVP):
//!
//! - the dominant left/right eigenvectors `l`, `r` of the transfer operator
//!   (the completely positive "eps" maps of the state), found by power
//!   iteration and brought to canonical form by gauge fixing;
//! - the two-site effective operator `C`, the nearest-neighbour Hamiltonian
//!   contracted with pairs of site tensors;
//! - the effective energy-density operator `K` (and optionally its
//!   left-handed counterpart), obtained from a quasi-inverse of the transfer
//!   operator on the complement of its dominant eigenspace;
//! - the tangent-space basis `Vsh` and gradient tensor `B`, which span and
//!   extremize over the directions orthogonal to pure gauge transformations.
//!
//! Imaginary time steps (`dτ` real) drive the state towards the ground state
//! of the supplied nearest-neighbour Hamiltonian; imaginary `dτ` gives
//! real-time dynamics. The stationarity measure `eta` (the tangent-gradient
//! norm) characterizes convergence: `eta → 0` at a ground state.
//!
//! Iterative sub-solvers never abort: non-convergence and failed invariant
//! checks are recorded as [`Diagnostic`] events on the engine (see
//! [`Umps::diagnostics`]), while genuine environmental failures (I/O, LAPACK
//! errors on invalid input) surface as [`UmpsError`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use num_complex::Complex64 as C64;
//! use rand::thread_rng;
//! use umps_tdvp::umps::{ Umps, UmpsConfig, Op2 };
//!
//! // transverse-field Ising interaction: -J σz σz - h σx
//! let (j, hx) = (1.0, 0.5);
//! let ham: Arc<Op2> = Arc::new(move |s, t, u, v| {
//!     let mut res = 0.0;
//!     if s == u && t == v {
//!         res -= j * if (s + t) % 2 == 0 { 1.0 } else { -1.0 };
//!     }
//!     if s != u && t == v { res -= hx; }
//!     C64::from(res)
//! });
//!
//! let mut rng = thread_rng();
//! let mut s = Umps::new(16, 2, ham, UmpsConfig::default(), &mut rng).unwrap();
//! let dtau = C64::from(0.04);
//! for _ in 0..500 {
//!     s.update().unwrap();
//!     s.take_step(dtau, None).unwrap();
//!     if s.eta() < 1e-6 { break; }
//! }
//! println!("h = {}, S = {}", s.h().re, s.entropy());
//! ```

use std::{ fmt, fs::File, path::Path, sync::Arc };
use itertools::Itertools;
use ndarray as nd;
use ndarray_linalg::{ Cholesky, Eigh, SVD, UPLO };
use ndarray_npy::{ NpzReader, NpzWriter, ReadNpzError, WriteNpzError };
use num_complex::Complex64 as C64;
use rand::Rng;
use thiserror::Error;
use crate::{
    bicgstab::{ self, LinearOp },
    diag::{ Diagnostic, Side },
    gauge::{ self, FixedPoint, Gauge },
    mat::{ self, norm_fro },
    pool,
};

#[derive(Debug, Error)]
pub enum UmpsError {
    /// Returned when attempting to create an engine with a zero bond or
    /// physical dimension.
    #[error("error in engine creation: dimensions must be nonzero")]
    ZeroDimension,

    /// Returned when an expansion target is smaller than the current
    /// dimension.
    #[error("error in state expansion: new dimension may not shrink")]
    ShrinkExpansion,

    /// Returned when a supplied tensor does not match the engine's
    /// dimensions.
    #[error("error in tensor replacement: shape mismatch")]
    ShapeMismatch,

    /// Returned when the line search fails to bracket a minimum even with
    /// the fallback bracket.
    #[error("error in line search: could not bracket a minimum")]
    NoBracket,

    /// A LAPACK-backed factorization (Cholesky, eigendecomposition, SVD)
    /// rejected its input.
    #[error("linear algebra backend error: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error("state file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file write error: {0}")]
    WriteNpz(#[from] WriteNpzError),

    #[error("state file read error: {0}")]
    ReadNpz(#[from] ReadNpzError),
}
pub type UmpsResult<T> = Result<T, UmpsError>;

/// One-site operator callback: `op(s, t)` is the matrix element connecting
/// incoming physical index `t` to outgoing `s`. Zero entries are skipped.
pub type Op1 = dyn Fn(usize, usize) -> C64 + Send + Sync;

/// Two-site (nearest-neighbour) operator callback: `op(s, t, u, v)` connects
/// incoming `(u, v)` to outgoing `(s, t)`. Zero entries are skipped.
pub type Op2 = dyn Fn(usize, usize, usize, usize) -> C64 + Send + Sync;

/// Strategy for building the two-site effective operator `C`.
///
/// Both strategies produce numerically identical results; `Threaded` farms
/// the independent (s, t) blocks out to a scoped worker pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Contraction {
    #[default]
    Serial,
    /// Worker count; `0` means one per logical CPU.
    Threaded(usize),
}

/// Per-instance engine configuration.
///
/// Every engine owns its own copy; instances never observe each other's
/// settings.
#[derive(Clone, Debug)]
pub struct UmpsConfig {
    /// Canonical form restored by [`Umps::update`].
    pub gauge: Gauge,
    /// Relative tolerance for the quasi-inverse Krylov solves.
    pub itr_rtol: f64,
    /// Absolute tolerance for the fixed-point power iterations.
    pub itr_atol: f64,
    /// Iteration cap for the fixed-point power iterations.
    pub max_itr_lr: usize,
    /// Iteration cap for the quasi-inverse Krylov solves.
    pub max_itr_pinv: usize,
    /// Run the optional (non-fatal) invariant checks after each stage.
    pub sanity_checks: bool,
    /// Slack factor applied to the iteration tolerances when checking
    /// invariants.
    pub check_fac: f64,
    /// Strategy for the two-site Hamiltonian contraction.
    pub contraction: Contraction,
}

impl Default for UmpsConfig {
    fn default() -> Self {
        Self {
            gauge: Gauge::RightCanonical,
            itr_rtol: 1e-13,
            itr_atol: 1e-14,
            max_itr_lr: 2000,
            max_itr_pinv: 1000,
            sanity_checks: false,
            check_fac: 50.0,
            contraction: Contraction::Serial,
        }
    }
}

// tolerance on |<l, r> - 1| for the post-solve normalization loop
const NORM_ATOL: f64 = 1e-13;

/// `eps_r(x) = Σ_s A[s]·x·A[s]†`, accumulated into `out`.
fn eps_r_map(
    a: &nd::ArrayView3<C64>,
    x: &nd::Array2<C64>,
    out: &mut nd::Array2<C64>,
) {
    out.fill(C64::new(0.0, 0.0));
    for a_s in a.outer_iter() {
        *out += &a_s.dot(x).dot(&mat::hconj(a_s));
    }
}

/// `eps_l(x) = Σ_s A[s]†·x·A[s]`, accumulated into `out`.
fn eps_l_map(
    a: &nd::ArrayView3<C64>,
    x: &nd::Array2<C64>,
    out: &mut nd::Array2<C64>,
) {
    out.fill(C64::new(0.0, 0.0));
    for a_s in a.outer_iter() {
        *out += &mat::hconj(a_s).dot(x).dot(&a_s);
    }
}

/// Power iteration for the dominant eigenvector of a transfer map.
///
/// `x` holds the starting guess and is overwritten with the final iterate.
/// Returns `(eigenvalue, residual, converged, iterations)`. A degenerate map
/// (every vector a fixed point) converges immediately to a valid, if
/// non-unique, fixed point.
fn power_iterate<F>(
    x: &mut nd::Array2<C64>,
    mut apply: F,
    max_itr: usize,
    atol: f64,
) -> (f64, f64, bool, usize)
where F: FnMut(&nd::Array2<C64>, &mut nd::Array2<C64>)
{
    let mut tmp: nd::Array2<C64> = nd::Array2::zeros(x.raw_dim());
    let n0 = norm_fro(x);
    if n0 > 0.0 {
        x.mapv_inplace(|z| z / n0);
    }
    let mut ev = 1.0;
    let mut res = f64::INFINITY;
    for i in 0..max_itr {
        apply(x, &mut tmp);
        ev = norm_fro(&tmp);
        tmp.mapv_inplace(|z| z / ev);
        res = x.iter().zip(tmp.iter())
            .map(|(a, b)| (a - b).norm_sqr())
            .sum::<f64>()
            .sqrt();
        x.assign(&tmp);
        if res < atol {
            return (ev, res, true, i + 1);
        }
    }
    (ev, res, false, max_itr)
}

fn stepped(a0: &nd::Array3<C64>, b: &nd::Array3<C64>, dtau: C64)
    -> nd::Array3<C64>
{
    let mut out = a0.clone();
    nd::Zip::from(&mut out).and(b)
        .for_each(|o, bv| { *o -= dtau * *bv; });
    out
}

/// The quasi-inverse operator `x ↦ x − e^{ip}·(E(x) − fp·⟨fp', x⟩)`: the
/// transfer operator with its dominant fixed-point component projected out,
/// subtracted from the identity. Nonsingular on the complement of the
/// dominant eigenspace.
///
/// The left orientation acts on conjugate-transposed operands (the
/// left-handed fixed-point equation is linear in `K†`, not `K`) and so
/// carries the conjugated momentum phase.
struct PpinvOp<'a> {
    a: nd::ArrayView3<'a, C64>,
    l: &'a nd::Array2<C64>,
    r: &'a nd::Array2<C64>,
    p: f64,
    left: bool,
}

impl LinearOp for PpinvOp<'_> {
    fn dim(&self) -> usize {
        let d = self.l.nrows();
        d * d
    }

    fn apply(&self, v: &nd::Array1<C64>) -> nd::Array1<C64> {
        let d = self.l.nrows();
        let x = v.clone().into_shape((d, d)).unwrap();
        let mut ex: nd::Array2<C64> = nd::Array2::zeros((d, d));
        let mut qeq = if self.left {
            eps_l_map(&self.a, &x, &mut ex);
            let coef = mat::adot(self.r, &x);
            ex - mat::hconj(self.l.view()).mapv(|z| z * coef)
        } else {
            eps_r_map(&self.a, &x, &mut ex);
            let coef = mat::adot(self.l, &x);
            ex - self.r.mapv(|z| z * coef)
        };
        if self.p != 0.0 {
            let phase = C64::cis(if self.left { -self.p } else { self.p });
            qeq.mapv_inplace(|z| z * phase);
        }
        (x - qeq).into_shape(d * d).unwrap()
    }
}

// cached square roots of the fixed points, resolved once per gradient
struct LrRoots {
    l_sqrt: FixedPoint,
    l_sqrt_i: FixedPoint,
    r_sqrt: FixedPoint,
    r_sqrt_i: FixedPoint,
}

/// A uniform matrix product state together with its TDVP working quantities.
///
/// All methods assume exclusive access (`&mut self` where state changes); no
/// two evolution steps can overlap on one instance. The usual driving cycle
/// is [`update`][Self::update] followed by [`take_step`][Self::take_step] /
/// [`take_step_rk4`][Self::take_step_rk4], monitoring [`eta`][Self::eta]
/// and [`h`][Self::h].
#[derive(Clone)]
pub struct Umps {
    pub(crate) d: usize,
    pub(crate) q: usize,
    // site tensor, axis signature [s, i, j]
    pub(crate) a: nd::Array3<C64>,
    // pair products A[s]·A[t], axes [s, t, i, j]
    pub(crate) aa: nd::Array4<C64>,
    // two-site effective operator, axes [s, t, i, j]
    pub(crate) c: nd::Array4<C64>,
    pub(crate) k: nd::Array2<C64>,
    pub(crate) k_left: Option<nd::Array2<C64>>,
    pub(crate) l: FixedPoint,
    pub(crate) r: FixedPoint,
    pub(crate) conv_l: bool,
    pub(crate) conv_r: bool,
    pub(crate) h: C64,
    pub(crate) eta: f64,
    pub(crate) entropy: f64,
    pub(crate) ham: Arc<Op2>,
    pub(crate) cfg: UmpsConfig,
    pub(crate) userdata: Option<nd::Array1<C64>>,
    pub(crate) diags: Vec<Diagnostic>,
}

impl fmt::Debug for Umps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Umps")
            .field("d", &self.d)
            .field("q", &self.q)
            .field("h", &self.h)
            .field("eta", &self.eta)
            .field("entropy", &self.entropy)
            .finish_non_exhaustive()
    }
}

impl Umps {
    /// Create a new engine with bond dimension `d` and physical dimension
    /// `q` for the nearest-neighbour Hamiltonian `ham`, with the site tensor
    /// initialized to uniform random entries in `[-0.5, 0.5]` per component.
    ///
    /// Fails if either dimension is zero.
    pub fn new<R>(
        d: usize,
        q: usize,
        ham: Arc<Op2>,
        cfg: UmpsConfig,
        rng: &mut R,
    ) -> UmpsResult<Self>
    where R: Rng + ?Sized
    {
        if d == 0 || q == 0 { return Err(UmpsError::ZeroDimension); }
        let mut new = Self {
            d,
            q,
            a: nd::Array3::zeros((q, d, d)),
            aa: nd::Array4::zeros((q, q, d, d)),
            c: nd::Array4::zeros((q, q, d, d)),
            k: nd::Array2::ones((d, d)),
            k_left: None,
            l: FixedPoint::Dense(nd::Array2::ones((d, d))),
            r: FixedPoint::Dense(nd::Array2::ones((d, d))),
            conv_l: true,
            conv_r: true,
            h: C64::new(0.0, 0.0),
            eta: 0.0,
            entropy: 0.0,
            ham,
            cfg,
            userdata: None,
            diags: Vec::new(),
        };
        new.randomize(0.5, rng);
        Ok(new)
    }

    /// Re-draw the site tensor uniformly in `[-fac, fac]` per component.
    pub fn randomize<R>(&mut self, fac: f64, rng: &mut R)
    where R: Rng + ?Sized
    {
        mat::randomize(&mut self.a, (-fac, fac), (-fac, fac), rng);
    }

    #[inline]
    pub fn dim(&self) -> usize { self.d }

    #[inline]
    pub fn phys_dim(&self) -> usize { self.q }

    #[inline]
    pub fn site_tensor(&self) -> &nd::Array3<C64> { &self.a }

    /// Replace the site tensor, e.g. with a known product state. Every
    /// derived quantity is stale until the next [`update`][Self::update].
    pub fn set_site_tensor(&mut self, a: nd::Array3<C64>) -> UmpsResult<()> {
        if a.shape() != [self.q, self.d, self.d] {
            return Err(UmpsError::ShapeMismatch);
        }
        self.a = a;
        Ok(())
    }

    #[inline]
    pub fn l(&self) -> &FixedPoint { &self.l }

    #[inline]
    pub fn r(&self) -> &FixedPoint { &self.r }

    #[inline]
    pub fn k(&self) -> &nd::Array2<C64> { &self.k }

    #[inline]
    pub fn k_left(&self) -> Option<&nd::Array2<C64>> { self.k_left.as_ref() }

    /// Current nearest-neighbour energy density, set by the last
    /// [`calc_k`][Self::calc_k] (or [`update`][Self::update]).
    #[inline]
    pub fn h(&self) -> C64 { self.h }

    /// Norm of the tangent-space gradient from the last
    /// [`calc_b`][Self::calc_b]; `eta → 0` characterizes a stationary
    /// (ground) state.
    #[inline]
    pub fn eta(&self) -> f64 { self.eta }

    /// Entanglement entropy across a bond, from the last gauge fixing.
    #[inline]
    pub fn entropy(&self) -> f64 { self.entropy }

    /// Whether the last left/right fixed-point power iterations converged.
    #[inline]
    pub fn lr_converged(&self) -> (bool, bool) { (self.conv_l, self.conv_r) }

    #[inline]
    pub fn config(&self) -> &UmpsConfig { &self.cfg }

    /// Schmidt coefficients across a bond, when the state is in canonical
    /// form (`None` otherwise).
    pub fn schmidt(&self) -> Option<nd::Array1<f64>> {
        match (&self.l, self.cfg.gauge) {
            (FixedPoint::Diagonal(lam), Gauge::RightCanonical)
                => Some(lam.mapv(f64::sqrt)),
            (FixedPoint::Diagonal(sv), Gauge::Symmetric) => Some(sv.clone()),
            _ => None,
        }
    }

    /// Recoverable numerical events recorded since the last drain.
    pub fn diagnostics(&self) -> &[Diagnostic] { &self.diags }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diags)
    }

    pub fn set_userdata(&mut self, userdata: Option<nd::Array1<C64>>) {
        self.userdata = userdata;
    }

    pub fn userdata(&self) -> Option<&nd::Array1<C64>> {
        self.userdata.as_ref()
    }

    fn check_tol(&self) -> f64 {
        self.cfg.check_fac * (self.cfg.itr_rtol + self.cfg.itr_atol)
    }

    fn check_dev(&mut self, check: &'static str, deviation: f64) {
        if !(deviation <= self.check_tol()) {
            self.diags.push(
                Diagnostic::InvariantViolation { check, deviation });
        }
    }

    /* transfer operator ************************************************/

    /// Right "eps" map `Σ_s A[s]·x·A[s]†`.
    pub fn eps_r(&self, x: &nd::Array2<C64>) -> nd::Array2<C64> {
        let mut out = nd::Array2::zeros((self.d, self.d));
        eps_r_map(&self.a.view(), x, &mut out);
        out
    }

    /// Left (adjoint) "eps" map `Σ_s A[s]†·x·A[s]`.
    pub fn eps_l(&self, x: &nd::Array2<C64>) -> nd::Array2<C64> {
        let mut out = nd::Array2::zeros((self.d, self.d));
        eps_l_map(&self.a.view(), x, &mut out);
        out
    }

    /// [`eps_r`][Self::eps_r] into a caller-provided `D × D` buffer.
    pub fn eps_r_into(&self, x: &nd::Array2<C64>, out: &mut nd::Array2<C64>) {
        eps_r_map(&self.a.view(), x, out);
    }

    /// [`eps_l`][Self::eps_l] into a caller-provided `D × D` buffer.
    pub fn eps_l_into(&self, x: &nd::Array2<C64>, out: &mut nd::Array2<C64>) {
        eps_l_map(&self.a.view(), x, out);
    }

    /// Right eps map contracted with a one-site operator:
    /// `Σ_{s,t} op(s,t)·A[t]·x·A[s]†`.
    pub fn eps_r_op(&self, x: &nd::Array2<C64>, op: &Op1)
        -> nd::Array2<C64>
    {
        let mut out: nd::Array2<C64> = nd::Array2::zeros((self.d, self.d));
        for s in 0..self.q {
            for t in 0..self.q {
                let o = op(s, t);
                if o != C64::new(0.0, 0.0) {
                    let a_t = self.a.index_axis(nd::Axis(0), t);
                    let a_s = self.a.index_axis(nd::Axis(0), s);
                    out += &(a_t.dot(x).dot(&mat::hconj(a_s)) * o);
                }
            }
        }
        out
    }

    /// Right eps map over two sites contracted with a two-site operator.
    ///
    /// Uses the cached pair products; requires [`calc_aa`][Self::calc_aa]
    /// to be current.
    pub fn eps_r_2s(&self, x: &nd::Array2<C64>, op: &Op2)
        -> nd::Array2<C64>
    {
        let mut res: nd::Array2<C64> = nd::Array2::zeros((self.d, self.d));
        for u in 0..self.q {
            for v in 0..self.q {
                let mut subres: nd::Array2<C64>
                    = nd::Array2::zeros((self.d, self.d));
                let mut any = false;
                for s in 0..self.q {
                    for t in 0..self.q {
                        let o = op(u, v, s, t);
                        if o != C64::new(0.0, 0.0) {
                            subres.scaled_add(
                                o, &self.aa.slice(nd::s![s, t, .., ..]));
                            any = true;
                        }
                    }
                }
                if any {
                    let aa_uv = self.aa.slice(nd::s![u, v, .., ..]);
                    res += &subres.dot(x).dot(&mat::hconj(aa_uv));
                }
            }
        }
        res
    }

    /* dominant eigenvectors ********************************************/

    fn rescale_a(&mut self, ev: f64) {
        if (ev - 1.0).abs() > self.cfg.itr_atol {
            let fac = 1.0 / ev.sqrt();
            self.a.mapv_inplace(|z| z * fac);
        }
    }

    /// Find the dominant left and right transfer-operator eigenvectors by
    /// power iteration, rescale the site tensor to unit spectral radius, and
    /// normalize so that `⟨l, r⟩ = 1`.
    ///
    /// Warm-starts from the previous `l` and `r`. Non-convergence is
    /// recorded as a [`Diagnostic`], keeping the last iterate.
    pub fn calc_lr(&mut self) {
        let atol = self.cfg.itr_atol;
        let max_itr = self.cfg.max_itr_lr;

        let mut l = self.l.to_dense();
        let a_view = self.a.view();
        let (ev, res, conv, itr) = power_iterate(
            &mut l, |x, out| eps_l_map(&a_view, x, out), max_itr, atol);
        self.conv_l = conv;
        if !conv {
            self.diags.push(Diagnostic::FixedPointNoConverge {
                side: Side::Left, iterations: itr, residual: res,
            });
        }
        self.rescale_a(ev);

        let mut r = self.r.to_dense();
        let a_view = self.a.view();
        let (ev, res, conv, itr) = power_iterate(
            &mut r, |x, out| eps_r_map(&a_view, x, out), max_itr, atol);
        self.conv_r = conv;
        if !conv {
            self.diags.push(Diagnostic::FixedPointNoConverge {
                side: Side::Right, iterations: itr, residual: res,
            });
        }
        self.rescale_a(ev);

        match self.cfg.gauge {
            Gauge::Symmetric => {
                let mut norm = mat::adot(&l, &r).re;
                let mut itr = 0;
                while (norm - 1.0).abs() > NORM_ATOL && itr < 10 {
                    let fac = 1.0 / norm.sqrt();
                    l.mapv_inplace(|z| z * fac);
                    r.mapv_inplace(|z| z * fac);
                    norm = mat::adot(&l, &r).re;
                    itr += 1;
                }
                if (norm - 1.0).abs() > NORM_ATOL {
                    self.diags.push(Diagnostic::NormalizationStalled {
                        iterations: itr, deviation: (norm - 1.0).abs(),
                    });
                }
            },
            Gauge::RightCanonical => {
                // fix the scale split so that tr(r) = D
                let fac = self.d as f64 / r.diag().sum().re;
                l.mapv_inplace(|z| z / fac);
                r.mapv_inplace(|z| z * fac);
                let mut norm = mat::adot(&l, &r).re;
                let mut itr = 0;
                while (norm - 1.0).abs() > NORM_ATOL && itr < 10 {
                    l.mapv_inplace(|z| z / norm);
                    norm = mat::adot(&l, &r).re;
                    itr += 1;
                }
                if (norm - 1.0).abs() > NORM_ATOL {
                    self.diags.push(Diagnostic::NormalizationStalled {
                        iterations: itr, deviation: (norm - 1.0).abs(),
                    });
                }
            },
        }

        if self.cfg.sanity_checks {
            let mut tmp = nd::Array2::zeros((self.d, self.d));
            eps_l_map(&self.a.view(), &l, &mut tmp);
            self.check_dev("left fixed point", norm_fro(&(&tmp - &l)));
            eps_r_map(&self.a.view(), &r, &mut tmp);
            self.check_dev("right fixed point", norm_fro(&(&tmp - &r)));
            self.check_dev("l hermitian",
                norm_fro(&(&l - &mat::hconj(l.view()))));
            self.check_dev("r hermitian",
                norm_fro(&(&r - &mat::hconj(r.view()))));
            if let Ok((ev, _)) = l.eigh(UPLO::Lower) {
                let min = ev.iter().copied().fold(f64::INFINITY, f64::min);
                self.check_dev("l positive definite", (-min).max(0.0));
            }
            if let Ok((ev, _)) = r.eigh(UPLO::Lower) {
                let min = ev.iter().copied().fold(f64::INFINITY, f64::min);
                self.check_dev("r positive definite", (-min).max(0.0));
            }
            self.check_dev("normalization <l, r> = 1",
                (mat::adot(&l, &r) - 1.0).norm());
        }

        self.l = FixedPoint::Dense(l);
        self.r = FixedPoint::Dense(r);
    }

    /* canonical form ***************************************************/

    /// Bring the state to the configured canonical form.
    ///
    /// Requires current fixed points from [`calc_lr`][Self::calc_lr].
    /// Idempotent up to numerical tolerance: reapplying to an
    /// already-canonical state is a no-op within ~1e-12.
    pub fn restore_cf(&mut self) -> UmpsResult<()> {
        match self.cfg.gauge {
            Gauge::RightCanonical => self.restore_rcf(),
            Gauge::Symmetric => self.restore_scf(),
        }
    }

    fn restore_rcf(&mut self) -> UmpsResult<()> {
        let d = self.d;
        let r = self.r.to_dense();
        // G makes r the identity; the eigenbasis of the transformed l then
        // diagonalizes it without disturbing r
        let g = r.cholesky(UPLO::Lower)?;
        let g_i = mat::invtr(&g, UPLO::Lower)?;
        let l1 = mat::mmul3(&mat::hconj(g.view()), &self.l.to_dense(), &g);
        let (ev, vecs) = l1.eigh(UPLO::Lower)?;
        let g = g.dot(&vecs);
        let g_i = mat::hconj(vecs.view()).dot(&g_i);
        for mut a_s in self.a.outer_iter_mut() {
            let new = g_i.dot(&a_s).dot(&g);
            a_s.assign(&new);
        }
        // ev holds the squared Schmidt coefficients
        self.entropy = gauge::entropy(&ev);
        self.l = FixedPoint::Diagonal(ev);

        if self.cfg.sanity_checks {
            let rt = mat::mmul3(&g_i, &r, &mat::hconj(g_i.view()));
            let eye: nd::Array2<C64> = nd::Array2::eye(d);
            self.check_dev("canonical r identity", norm_fro(&(&rt - &eye)));
            let mut tmp = nd::Array2::zeros((d, d));
            eps_r_map(&self.a.view(), &eye, &mut tmp);
            self.check_dev("right fixed point after gauge",
                norm_fro(&(&tmp - &eye)));
            let l_new = self.l.to_dense();
            eps_l_map(&self.a.view(), &l_new, &mut tmp);
            self.check_dev("left fixed point after gauge",
                norm_fro(&(&tmp - &l_new)));
        }

        self.r = FixedPoint::identity(d);
        Ok(())
    }

    fn restore_scf(&mut self) -> UmpsResult<()> {
        let d = self.d;
        let l = self.l.to_dense();
        let r = self.r.to_dense();
        let x = r.cholesky(UPLO::Lower)?;
        let y = l.cholesky(UPLO::Upper)?;
        let (u, sv, vh) = y.dot(&x).svd(true, true)?;
        let u = u.expect("svd: left vectors requested");
        let vh = vh.expect("svd: right vectors requested");
        // the singular values are the Schmidt coefficients
        let lam = sv.mapv(|s| s * s);
        self.entropy = gauge::entropy(&lam);
        let srt = nd::Array2::from_diag(&sv.mapv(|s| C64::from(s.sqrt())));
        let g = srt.dot(&vh).dot(&mat::invtr(&x, UPLO::Lower)?);
        let g_i = mat::invtr(&y, UPLO::Upper)?.dot(&u).dot(&srt);
        for mut a_s in self.a.outer_iter_mut() {
            let new = g.dot(&a_s).dot(&g_i);
            a_s.assign(&new);
        }

        if self.cfg.sanity_checks {
            let eye: nd::Array2<C64> = nd::Array2::eye(d);
            self.check_dev("gauge transform inverse",
                norm_fro(&(&g.dot(&g_i) - &eye)));
            let s_full = nd::Array2::from_diag(&sv.mapv(C64::from));
            let lt = mat::mmul3(&mat::hconj(g_i.view()), &l, &g_i);
            self.check_dev("symmetric l", norm_fro(&(&lt - &s_full)));
            let rt = mat::mmul3(&g, &r, &mat::hconj(g.view()));
            self.check_dev("symmetric r", norm_fro(&(&rt - &s_full)));
            let mut tmp = nd::Array2::zeros((d, d));
            eps_l_map(&self.a.view(), &s_full, &mut tmp);
            self.check_dev("left fixed point after gauge",
                norm_fro(&(&tmp - &s_full)));
            eps_r_map(&self.a.view(), &s_full, &mut tmp);
            self.check_dev("right fixed point after gauge",
                norm_fro(&(&tmp - &s_full)));
        }

        self.l = FixedPoint::Diagonal(sv.clone());
        self.r = FixedPoint::Diagonal(sv);
        Ok(())
    }

    /* effective Hamiltonian ********************************************/

    /// Rebuild the cached pair products `AA[s,t] = A[s]·A[t]`.
    pub fn calc_aa(&mut self) {
        for (s, t) in (0..self.q).cartesian_product(0..self.q) {
            let prod = self.a.index_axis(nd::Axis(0), s)
                .dot(&self.a.index_axis(nd::Axis(0), t));
            self.aa.slice_mut(nd::s![s, t, .., ..]).assign(&prod);
        }
    }

    /// Rebuild the two-site effective operator
    /// `C[s,t] = Σ_{u,v} h(s,t,u,v)·AA[u,v]` with the configured strategy.
    pub fn calc_c(&mut self) {
        match self.cfg.contraction {
            Contraction::Serial => {
                self.c.fill(C64::new(0.0, 0.0));
                for (s, t) in (0..self.q).cartesian_product(0..self.q) {
                    let mut block = self.c.slice_mut(nd::s![s, t, .., ..]);
                    for (u, v) in (0..self.q).cartesian_product(0..self.q) {
                        let hv = (self.ham)(s, t, u, v);
                        if hv != C64::new(0.0, 0.0) {
                            block.scaled_add(
                                hv, &self.aa.slice(nd::s![u, v, .., ..]));
                        }
                    }
                }
            },
            Contraction::Threaded(n) => {
                self.c = pool::build_c_threaded(&self.aa, &*self.ham, n);
            },
        }
    }

    /* quasi-inverse solves *********************************************/

    /// Solve the projected fixed-point equation
    /// `out − e^{ip}·(E(out) − fp·⟨fp', out⟩) = source` by warm-started
    /// BiCGStab.
    ///
    /// The momentum phase `p` is zero for the energy-density operators; a
    /// nonzero value is the hook for momentum-resolved (excitation)
    /// variants.
    fn calc_ppinv(
        &mut self,
        source: &nd::Array2<C64>,
        p: f64,
        left: bool,
        x0: &nd::Array2<C64>,
    ) -> nd::Array2<C64> {
        let d = self.d;
        let l = self.l.to_dense();
        let r = self.r.to_dense();
        let (rhs, mut sol) = if left {
            (
                mat::hconj(source.view()).into_shape(d * d).unwrap(),
                mat::hconj(x0.view()).into_shape(d * d).unwrap(),
            )
        } else {
            (
                source.to_owned().into_shape(d * d).unwrap(),
                x0.to_owned().into_shape(d * d).unwrap(),
            )
        };

        let op = PpinvOp { a: self.a.view(), l: &l, r: &r, p, left };
        let report = bicgstab::bicgstab(
            &op, &rhs, &mut sol, self.cfg.itr_rtol, self.cfg.max_itr_pinv);
        let resid_dev = self.cfg.sanity_checks
            .then(|| norm_fro(&(&op.apply(&sol) - &rhs)));

        if !report.converged {
            self.diags.push(Diagnostic::QuasiInverseNoConverge {
                side: if left { Side::Left } else { Side::Right },
                iterations: report.iterations,
                residual: report.residual,
            });
        }
        if let Some(dev) = resid_dev {
            self.check_dev("quasi-inverse residual", dev);
        }

        let out = sol.into_shape((d, d)).unwrap();
        if left { mat::hconj(out.view()) } else { out }
    }

    /// Compute the effective energy-density operator `K` from the
    /// right-eigenvector side, and with it the energy density `h`.
    ///
    /// Requires current `l`, `r`, `AA`, and `C`.
    pub fn calc_k(&mut self) {
        let d = self.d;
        let r = self.r.to_dense();
        let mut hr: nd::Array2<C64> = nd::Array2::zeros((d, d));
        for (s, t) in (0..self.q).cartesian_product(0..self.q) {
            let c_st = self.c.slice(nd::s![s, t, .., ..]);
            let aa_st = self.aa.slice(nd::s![s, t, .., ..]);
            hr += &c_st.dot(&r).dot(&mat::hconj(aa_st));
        }
        self.h = self.l.adot(&hr);
        let h = self.h;
        let qhr = &hr - &r.mapv(|z| z * h);
        let k0 = self.k.clone();
        self.k = self.calc_ppinv(&qhr, 0.0, false, &k0);
    }

    /// Compute the left-handed energy-density operator `K_left`, returning
    /// the energy density evaluated from the left side.
    pub fn calc_k_left(&mut self) -> C64 {
        let d = self.d;
        let l = self.l.to_dense();
        let r = self.r.to_dense();
        let mut lh: nd::Array2<C64> = nd::Array2::zeros((d, d));
        for (s, t) in (0..self.q).cartesian_product(0..self.q) {
            let c_st = self.c.slice(nd::s![s, t, .., ..]);
            let aa_st = self.aa.slice(nd::s![s, t, .., ..]);
            lh += &mat::hconj(aa_st).dot(&l).dot(&c_st);
        }
        let h = mat::adot(&lh, &r);
        let lhq = &lh - &l.mapv(|z| z * h);
        let k0 = self.k_left.clone()
            .unwrap_or_else(|| nd::Array2::ones((d, d)));
        let kl = self.calc_ppinv(&lhq, 0.0, true, &k0);
        self.k_left = Some(kl);
        h
    }

    /* tangent space ****************************************************/

    fn calc_lr_roots(&mut self) -> UmpsResult<LrRoots> {
        let l_sqrt = self.l.sqrt()?;
        let l_sqrt_i = l_sqrt.inv()?;
        let r_sqrt = self.r.sqrt()?;
        let r_sqrt_i = r_sqrt.inv()?;
        if self.cfg.sanity_checks {
            let eye: nd::Array2<C64> = nd::Array2::eye(self.d);
            let ls = l_sqrt.to_dense();
            let dev = norm_fro(&(&ls.dot(&ls) - &self.l.to_dense()));
            self.check_dev("l sqrt", dev);
            let dev = norm_fro(&(&ls.dot(&l_sqrt_i.to_dense()) - &eye));
            self.check_dev("l sqrt inverse", dev);
            let rs = r_sqrt.to_dense();
            let dev = norm_fro(&(&rs.dot(&rs) - &self.r.to_dense()));
            self.check_dev("r sqrt", dev);
            let dev = norm_fro(&(&rs.dot(&r_sqrt_i.to_dense()) - &eye));
            self.check_dev("r sqrt inverse", dev);
        }
        Ok(LrRoots { l_sqrt, l_sqrt_i, r_sqrt, r_sqrt_i })
    }

    /// Orthonormal basis for the tangent directions orthogonal to all pure
    /// gauge transformations: `Vsh[s]` of shape `D × (q−1)D` with
    /// `Σ_s Vsh[s]†·Vsh[s] = 1` and `Σ_s Vsh[s]†·r_sqrt·A[s]† = 0`.
    fn calc_vsh(&mut self, r_sqrt: &FixedPoint)
        -> UmpsResult<nd::Array3<C64>>
    {
        let (d, q) = (self.d, self.q);
        let mut rr: nd::Array3<C64> = nd::Array3::zeros((q, d, d));
        for (a_s, mut rr_s) in
            self.a.outer_iter().zip(rr.outer_iter_mut())
        {
            rr_s.assign(&r_sqrt.lmul(&mat::hconj(a_s)));
        }
        let rmat = rr.into_shape((q * d, d)).unwrap();
        let ns = mat::nullspace(&rmat)?;

        if self.cfg.sanity_checks {
            let eye: nd::Array2<C64> = nd::Array2::eye((q - 1) * d);
            let gram = mat::hconj(ns.view()).dot(&ns);
            self.check_dev("tangent basis orthonormal",
                norm_fro(&(&gram - &eye)));
            let overlap = mat::hconj(ns.view()).dot(&rmat);
            self.check_dev("tangent basis orthogonal to gauge directions",
                norm_fro(&overlap));
        }

        Ok(ns.into_shape((q, d, (q - 1) * d)).unwrap())
    }

    /// Gradient coordinates in the `Vsh` basis.
    fn calc_x(&self, roots: &LrRoots, vsh: &nd::Array3<C64>)
        -> nd::Array2<C64>
    {
        let (d, q) = (self.d, self.q);
        let l = self.l.to_dense();
        let r = self.r.to_dense();

        let mut part: nd::Array2<C64> = nd::Array2::zeros((d, (q - 1) * d));
        for s in 0..q {
            let a_s = self.a.index_axis(nd::Axis(0), s);
            let mut tmp = a_s.dot(&self.k);
            for t in 0..q {
                let c_st = self.c.slice(nd::s![s, t, .., ..]);
                let a_t = self.a.index_axis(nd::Axis(0), t);
                tmp += &c_st.dot(&r).dot(&mat::hconj(a_t));
            }
            part += &roots.r_sqrt_i.rmul(&tmp)
                .dot(&vsh.index_axis(nd::Axis(0), s));
        }
        let mut out = roots.l_sqrt.lmul(&part);

        part.fill(C64::new(0.0, 0.0));
        for s in 0..q {
            let mut tmp: nd::Array2<C64> = nd::Array2::zeros((d, d));
            for t in 0..q {
                let c_ts = self.c.slice(nd::s![t, s, .., ..]);
                let a_t = self.a.index_axis(nd::Axis(0), t);
                tmp += &mat::hconj(a_t).dot(&l).dot(&c_ts);
            }
            part += &roots.r_sqrt.rmul(&tmp)
                .dot(&vsh.index_axis(nd::Axis(0), s));
        }
        out += &roots.l_sqrt_i.lmul(&part);
        out
    }

    /// Un-project gradient coordinates into a site-tensor variation:
    /// `B[s] = l_sqrt⁻¹·x·Vsh[s]†·r_sqrt⁻¹`.
    fn b_from_x(
        &self,
        x: &nd::Array2<C64>,
        vsh: &nd::Array3<C64>,
        roots: &LrRoots,
    ) -> nd::Array3<C64> {
        let mut b: nd::Array3<C64> = nd::Array3::zeros(self.a.raw_dim());
        for (vsh_s, mut b_s) in vsh.outer_iter().zip(b.outer_iter_mut()) {
            let tmp = x.dot(&mat::hconj(vsh_s));
            b_s.assign(&roots.r_sqrt_i.rmul(&roots.l_sqrt_i.lmul(&tmp)));
        }
        b
    }

    /// Compute the tangent-space gradient `B` that locally extremizes the
    /// energy, updating `eta` (its norm in the orthonormal `Vsh`
    /// coordinates).
    ///
    /// Requires a fully [`update`][Self::update]d state. The returned
    /// tensor satisfies the gauge-fixing condition
    /// `Σ_s B[s]·r·A[s]† ≈ 0`.
    pub fn calc_b(&mut self) -> UmpsResult<nd::Array3<C64>> {
        self.calc_b_inner(true)
    }

    fn calc_b_inner(&mut self, set_eta: bool)
        -> UmpsResult<nd::Array3<C64>>
    {
        let roots = self.calc_lr_roots()?;
        let vsh = self.calc_vsh(&roots.r_sqrt)?;
        let x = self.calc_x(&roots, &vsh);
        if set_eta {
            self.eta = norm_fro(&x);
        }
        let b = self.b_from_x(&x, &vsh, &roots);

        if self.cfg.sanity_checks {
            let r = self.r.to_dense();
            let mut tst: nd::Array2<C64>
                = nd::Array2::zeros((self.d, self.d));
            for (b_s, a_s) in b.outer_iter().zip(self.a.outer_iter()) {
                tst += &b_s.dot(&r).dot(&mat::hconj(a_s));
            }
            self.check_dev("tangent gauge fixing", norm_fro(&tst));
        }

        Ok(b)
    }

    /* evolution ********************************************************/

    /// Recompute every derived quantity from the current site tensor:
    /// fixed points, canonical form, pair products, effective Hamiltonian,
    /// and energy-density operator.
    pub fn update(&mut self) -> UmpsResult<()> {
        self.calc_lr();
        self.restore_cf()?;
        self.calc_aa();
        self.calc_c();
        self.calc_k();
        Ok(())
    }

    // between RK4 stages the gauge is left untouched; only the derived
    // quantities are refreshed
    fn refresh(&mut self) {
        self.calc_lr();
        self.calc_aa();
        self.calc_c();
        self.calc_k();
    }

    /// Explicit Euler step `A ← A − dτ·B`.
    ///
    /// `dτ` real performs imaginary-time (ground-state) evolution; an
    /// imaginary `dτ` gives real-time dynamics. If `b` is `None` the
    /// gradient is computed in place.
    pub fn take_step(&mut self, dtau: C64, b: Option<&nd::Array3<C64>>)
        -> UmpsResult<()>
    {
        let b = match b {
            Some(b) => b.clone(),
            None => self.calc_b()?,
        };
        self.a = stepped(&self.a, &b, dtau);
        Ok(())
    }

    /// Fourth-order Runge-Kutta step, recomputing the derived quantities
    /// (but not the canonical form) at each stage.
    pub fn take_step_rk4(&mut self, dtau: C64, b: Option<&nd::Array3<C64>>)
        -> UmpsResult<()>
    {
        let a0 = self.a.clone();
        let half = dtau * 0.5;

        let b1 = match b {
            Some(b) => b.clone(),
            None => self.calc_b()?,
        };
        let mut b_fin = b1.clone();
        self.a = stepped(&a0, &b1, half);
        self.refresh();

        let b2 = self.calc_b_inner(false)?;
        nd::Zip::from(&mut b_fin).and(&b2)
            .for_each(|f, bv| { *f += *bv * 2.0; });
        self.a = stepped(&a0, &b2, half);
        self.refresh();

        let b3 = self.calc_b_inner(false)?;
        nd::Zip::from(&mut b_fin).and(&b3)
            .for_each(|f, bv| { *f += *bv * 2.0; });
        self.a = stepped(&a0, &b3, dtau);
        self.refresh();

        let b4 = self.calc_b_inner(false)?;
        nd::Zip::from(&mut b_fin).and(&b4)
            .for_each(|f, bv| { *f += *bv; });

        self.a = stepped(&a0, &b_fin, dtau / 6.0);
        Ok(())
    }

    /* expectation values ***********************************************/

    /// Expectation value of a one-site operator.
    pub fn expect_1s(&self, op: &Op1) -> C64 {
        let or = self.eps_r_op(&self.r.to_dense(), op);
        self.l.adot(&or)
    }

    /// Expectation value of a nearest-neighbour (two-site) operator.
    ///
    /// Requires current pair products from [`calc_aa`][Self::calc_aa].
    pub fn expect_2s(&self, op: &Op2) -> C64 {
        let res = self.eps_r_2s(&self.r.to_dense(), op);
        self.l.adot(&res)
    }

    /// Energy density of the stored Hamiltonian at the current state.
    pub fn eval_energy(&self) -> C64 {
        self.expect_2s(self.ham.as_ref())
    }

    /// Single-site reduced density matrix, `ρ[s,t] = ⟨l, A[t]·r·A[s]†⟩`.
    pub fn density_1s(&self) -> nd::Array2<C64> {
        let r = self.r.to_dense();
        nd::Array2::from_shape_fn((self.q, self.q), |(s, t)| {
            let a_s = self.a.index_axis(nd::Axis(0), s);
            let a_t = self.a.index_axis(nd::Axis(0), t);
            self.l.adot(&a_t.dot(&r).dot(&mat::hconj(a_s)))
        })
    }

    /// Apply a one-site operator to the state:
    /// `A[s] ← Σ_t op(s,t)·A[t]`.
    ///
    /// The result is in general unnormalized; call
    /// [`update`][Self::update] afterwards.
    pub fn apply_op_1s(&mut self, op: &Op1) {
        let mut new_a: nd::Array3<C64> = nd::Array3::zeros(self.a.raw_dim());
        for s in 0..self.q {
            let mut na_s = new_a.slice_mut(nd::s![s, .., ..]);
            for t in 0..self.q {
                let o = op(s, t);
                if o != C64::new(0.0, 0.0) {
                    na_s.scaled_add(o, &self.a.index_axis(nd::Axis(0), t));
                }
            }
        }
        self.a = new_a;
    }

    /* persistence & reshaping ******************************************/

    /// Persist `{A, l, r, K, userdata}` as an `.npz` archive.
    ///
    /// `userdata` overrides any userdata already stored on the engine.
    pub fn save_state<P>(
        &self,
        path: P,
        userdata: Option<&nd::Array1<C64>>,
    ) -> UmpsResult<()>
    where P: AsRef<Path>
    {
        let mut npz = NpzWriter::new(File::create(path)?);
        npz.add_array("a", &self.a)?;
        npz.add_array("l", &self.l.to_dense())?;
        npz.add_array("r", &self.r.to_dense())?;
        npz.add_array("k", &self.k)?;
        if let Some(u) = userdata.or(self.userdata.as_ref()) {
            npz.add_array("userdata", u)?;
        }
        npz.finish()?;
        Ok(())
    }

    /// Restore a state saved by [`save_state`][Self::save_state].
    ///
    /// Returns `Ok(false)`, without touching the current state, if the
    /// saved shapes are incompatible, unless the matching expansion flag is
    /// set: with `expand` a state saved at smaller bond dimension is
    /// adopted and grown back to the present `D` (see
    /// [`expand_d`][Self::expand_d]); with `expand_q` likewise for the
    /// physical dimension.
    pub fn load_state<P>(
        &mut self,
        path: P,
        expand: bool,
        expand_q: bool,
    ) -> UmpsResult<bool>
    where P: AsRef<Path>
    {
        let mut npz = NpzReader::new(File::open(path)?)?;
        let new_a: nd::Array3<C64> = npz_read(&mut npz, "a")?;
        let new_l: nd::Array2<C64> = npz_read(&mut npz, "l")?;
        let new_r: nd::Array2<C64> = npz_read(&mut npz, "r")?;
        let new_k: nd::Array2<C64> = npz_read(&mut npz, "k")?;
        let userdata: Option<nd::Array1<C64>>
            = npz_read(&mut npz, "userdata").ok();

        let sh = new_a.shape().to_vec();
        let (sq, sd) = (sh[0], sh[1]);
        if sh[1] != sh[2] {
            return Ok(false);
        }
        if sq == self.q && sd == self.d {
            self.adopt(new_a, new_l, new_r, new_k, userdata);
            Ok(true)
        } else if expand && sq == self.q && sd < self.d {
            let target = self.d;
            self.adopt(new_a, new_l, new_r, new_k, userdata);
            self.expand_d(target, &mut rand::thread_rng())?;
            Ok(true)
        } else if expand_q && sd == self.d && sq < self.q {
            let target = self.q;
            self.adopt(new_a, new_l, new_r, new_k, userdata);
            self.expand_q(target)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn adopt(
        &mut self,
        a: nd::Array3<C64>,
        l: nd::Array2<C64>,
        r: nd::Array2<C64>,
        k: nd::Array2<C64>,
        userdata: Option<nd::Array1<C64>>,
    ) {
        let sh = a.shape().to_vec();
        self.q = sh[0];
        self.d = sh[1];
        self.a = a;
        self.l = FixedPoint::Dense(l);
        self.r = FixedPoint::Dense(r);
        self.k = k;
        self.k_left = None;
        self.aa = nd::Array4::zeros((self.q, self.q, self.d, self.d));
        self.c = nd::Array4::zeros((self.q, self.q, self.d, self.d));
        if userdata.is_some() {
            self.userdata = userdata;
        }
    }

    /// Grow the bond dimension to `new_d`.
    ///
    /// The original `D × D` block of every matrix is preserved. New
    /// off-diagonal blocks of the site tensor are seeded with small random
    /// entries scaled by the existing tensor's norm; the new corner block
    /// stays zero. The fixed points and `K` are padded with small constant
    /// entries and serve only as warm starts for the next
    /// [`update`][Self::update].
    pub fn expand_d<R>(&mut self, new_d: usize, rng: &mut R)
        -> UmpsResult<()>
    where R: Rng + ?Sized
    {
        if new_d < self.d { return Err(UmpsError::ShrinkExpansion); }
        if new_d == self.d { return Ok(()); }
        let (q, old_d) = (self.q, self.d);

        let old_a = std::mem::replace(
            &mut self.a, nd::Array3::zeros((q, new_d, new_d)));
        let old_l = self.l.to_dense();
        let old_r = self.r.to_dense();
        let old_k = std::mem::replace(
            &mut self.k, nd::Array2::zeros((new_d, new_d)));

        let denom = (q * old_d * old_d) as f64;
        let realfac
            = old_a.iter().map(|z| z.re * z.re).sum::<f64>().sqrt() / denom;
        let imagfac
            = old_a.iter().map(|z| z.im * z.im).sum::<f64>().sqrt() / denom;
        mat::randomize(
            &mut self.a.slice_mut(nd::s![.., ..old_d, old_d..]),
            (0.0, realfac), (0.0, imagfac), rng);
        mat::randomize(
            &mut self.a.slice_mut(nd::s![.., old_d.., ..old_d]),
            (0.0, realfac), (0.0, imagfac), rng);
        self.a.slice_mut(nd::s![.., ..old_d, ..old_d]).assign(&old_a);

        let fill = |m: &nd::Array2<C64>| {
            C64::from(norm_fro(m) / (old_d * old_d) as f64)
        };
        let mut l = nd::Array2::from_elem((new_d, new_d), fill(&old_l));
        l.slice_mut(nd::s![..old_d, ..old_d]).assign(&old_l);
        let mut r = nd::Array2::from_elem((new_d, new_d), fill(&old_r));
        r.slice_mut(nd::s![..old_d, ..old_d]).assign(&old_r);
        let mut k = nd::Array2::from_elem((new_d, new_d), fill(&old_k));
        k.slice_mut(nd::s![..old_d, ..old_d]).assign(&old_k);

        self.l = FixedPoint::Dense(l);
        self.r = FixedPoint::Dense(r);
        self.k = k;
        self.k_left = None;
        self.d = new_d;
        self.aa = nd::Array4::zeros((q, q, new_d, new_d));
        self.c = nd::Array4::zeros((q, q, new_d, new_d));
        Ok(())
    }

    /// Grow the physical dimension to `new_q`, zero-filling the new site
    /// matrices.
    pub fn expand_q(&mut self, new_q: usize) -> UmpsResult<()> {
        if new_q < self.q { return Err(UmpsError::ShrinkExpansion); }
        if new_q == self.q { return Ok(()); }
        let (old_q, d) = (self.q, self.d);
        let old_a = std::mem::replace(
            &mut self.a, nd::Array3::zeros((new_q, d, d)));
        self.a.slice_mut(nd::s![..old_q, .., ..]).assign(&old_a);
        self.q = new_q;
        self.aa = nd::Array4::zeros((new_q, new_q, d, d));
        self.c = nd::Array4::zeros((new_q, new_q, d, d));
        Ok(())
    }

    /// Perturb the site tensor by bounded random noise with relative
    /// strength `f` (useful for escaping saddle points or checking
    /// stability of a converged state).
    pub fn fuzz_state<R>(&mut self, f: f64, rng: &mut R)
    where R: Rng + ?Sized
    {
        let fac
            = f * norm_fro(&self.a) / (self.q * self.d * self.d) as f64;
        let mut noise: nd::Array3<C64> = nd::Array3::zeros(self.a.raw_dim());
        mat::randomize(
            &mut noise,
            (-fac / 2.0, fac / 2.0),
            (-fac / 2.0, fac / 2.0),
            rng,
        );
        self.a += &noise;
    }
}

fn npz_read<D>(npz: &mut NpzReader<File>, name: &str)
    -> Result<nd::Array<C64, D>, ReadNpzError>
where D: nd::Dimension
{
    // numpy archives may or may not carry the member extension
    let with_ext = format!("{name}.npy");
    npz.by_name(name).or_else(|_| npz.by_name(&with_ext))
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use super::*;

    fn hermitian_posdef(d: usize, rng: &mut StdRng) -> nd::Array2<C64> {
        let mut m: nd::Array2<C64> = nd::Array2::zeros((d, d));
        mat::randomize(&mut m, (-0.5, 0.5), (-0.5, 0.5), rng);
        let mut p = m.dot(&mat::hconj(m.view()));
        for i in 0..d { p[[i, i]] += C64::from(0.5); }
        p
    }

    // with Hermitian l, r the left orientation is the adjoint of the right
    // one under the Hilbert-Schmidt inner product, momentum phase included
    #[test]
    fn quasi_inverse_orientations_are_adjoint() {
        let (q, d) = (2, 5);
        let mut rng = StdRng::seed_from_u64(40);
        let mut a: nd::Array3<C64> = nd::Array3::zeros((q, d, d));
        mat::randomize(&mut a, (-0.5, 0.5), (-0.5, 0.5), &mut rng);
        let l = hermitian_posdef(d, &mut rng);
        let r = hermitian_posdef(d, &mut rng);
        let mut x: nd::Array1<C64> = nd::Array1::zeros(d * d);
        let mut y: nd::Array1<C64> = nd::Array1::zeros(d * d);
        mat::randomize(&mut x, (-1.0, 1.0), (-1.0, 1.0), &mut rng);
        mat::randomize(&mut y, (-1.0, 1.0), (-1.0, 1.0), &mut rng);

        let p = 0.7;
        let right = PpinvOp { a: a.view(), l: &l, r: &r, p, left: false };
        let left = PpinvOp { a: a.view(), l: &l, r: &r, p, left: true };
        let lhs = mat::adot(&y, &right.apply(&x));
        let rhs = mat::adot(&left.apply(&y), &x);
        assert!((lhs - rhs).norm() < 1e-12, "{lhs} vs {rhs}");
    }
}
