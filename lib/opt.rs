//! Line searches and nonlinear conjugate-gradient acceleration for
//! imaginary-time ground-state search.
//!
//! A plain Euler step `A ← A − dτ·B` converges for small fixed `dτ`, but a
//! line search along `B` (or along a Fletcher-Reeves conjugate direction)
//! takes far fewer energy evaluations to reach a given `eta`. Every energy
//! evaluation here recomputes the fixed points and pair products at the
//! trial tensor; the probed engine always gets its site tensor and energy
//! restored afterwards, with the fixed points left as warm starts for the
//! next solve.

use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::{
    diag::Diagnostic,
    umps::{ Umps, UmpsError, UmpsResult },
};

const GOLD: f64 = 1.618033988749895;
// inverse-golden fraction used by Brent's golden-section fallback steps
const CGOLD: f64 = 0.3819660112501051;
// absolute floor on the Brent convergence interval
const MINTOL: f64 = 1e-11;

fn set_trial(
    a: &mut nd::Array3<C64>,
    a0: &nd::Array3<C64>,
    b: &nd::Array3<C64>,
    tau: f64,
) {
    nd::Zip::from(a).and(a0).and(b)
        .for_each(|av, a0v, bv| { *av = *a0v - *bv * tau; });
}

/// Doubling/halving line search for a minimum of the energy along `-b`.
///
/// Starting from step size `dtau_init`, the step grows by 10% (capped at
/// ten times the initial size) while the energy keeps falling and halves
/// with a direction flip when it rises, until the step is smaller than
/// `tol` relative to the distance travelled or 30 evaluations have been
/// spent. Returns the accumulated displacement; the engine's site tensor
/// and energy are restored, the fixed points keep their last warm start.
pub fn find_min_h(
    s: &mut Umps,
    b: &nd::Array3<C64>,
    dtau_init: f64,
    tol: f64,
) -> f64 {
    let mut dtau = dtau_init;
    let mut d = 1.0_f64;
    let mut tau_min = 0.0_f64;

    let a0 = s.a.clone();
    let h0 = s.h;
    let mut h_min = s.h.re;
    let mut a_min = s.a.clone();
    let mut l_min = s.l.clone();
    let mut r_min = s.r.clone();

    let mut itr = 0;
    while itr == 0
        || (itr < 30 && (tau_min == 0.0 || (dtau / tau_min).abs() > tol))
    {
        itr += 1;
        set_trial(&mut s.a, &a_min, b, d * dtau);
        s.l = l_min.clone();
        s.r = r_min.clone();
        s.calc_lr();
        s.calc_aa();
        s.h = s.eval_energy();

        if s.h.re < h_min {
            h_min = s.h.re;
            a_min.assign(&s.a);
            l_min = s.l.clone();
            r_min = s.r.clone();
            tau_min += d * dtau;
            dtau = (dtau * 1.1).min(dtau_init * 10.0);
        } else {
            d = -d;
            dtau /= 2.0;
        }
    }

    s.a = a0;
    s.h = h0;
    tau_min
}

// one energy evaluation per distinct step length, memoized
struct LineEval<'a> {
    s: &'a mut Umps,
    a0: nd::Array3<C64>,
    b: &'a nd::Array3<C64>,
    h0: f64,
    cache: Vec<(f64, f64)>,
}

impl LineEval<'_> {
    fn eval(&mut self, tau: f64) -> f64 {
        if tau == 0.0 { return self.h0; }
        if let Some((_, h))
            = self.cache.iter().find(|(t, _)| *t == tau)
        {
            return *h;
        }
        set_trial(&mut self.s.a, &self.a0, self.b, tau);
        self.s.calc_lr();
        self.s.calc_aa();
        let h = self.s.eval_energy().re;
        self.cache.push((tau, h));
        h
    }
}

struct Bracket {
    xa: f64,
    xb: f64,
    xc: f64,
    fb: f64,
}

fn verify_bracket(ev: &mut LineEval, xa: f64, xb: f64, xc: f64)
    -> Option<Bracket>
{
    let fa = ev.eval(xa);
    let fb = ev.eval(xb);
    let fc = ev.eval(xc);
    let ok = fa.is_finite() && fb.is_finite() && fc.is_finite()
        && fb <= fa && fb <= fc;
    ok.then_some(Bracket { xa, xb, xc, fb })
}

/// Golden-ratio downhill expansion from two starting points.
fn search_bracket(ev: &mut LineEval, xa0: f64, xb0: f64) -> Option<Bracket> {
    let (mut xa, mut xb) = (xa0, xb0);
    let mut fa = ev.eval(xa);
    let mut fb = ev.eval(xb);
    if fa < fb {
        std::mem::swap(&mut xa, &mut xb);
        std::mem::swap(&mut fa, &mut fb);
    }
    let mut xc = xb + GOLD * (xb - xa);
    let mut fc = ev.eval(xc);
    let mut itr = 0;
    while fc < fb {
        if itr >= 50 || !fc.is_finite() { return None; }
        itr += 1;
        xa = xb;
        fa = fb;
        xb = xc;
        fb = fc;
        xc = xb + GOLD * (xb - xa);
        fc = ev.eval(xc);
    }
    (fa.is_finite() && fb.is_finite() && fc.is_finite())
        .then_some(Bracket { xa, xb, xc, fb })
}

/// Brent's derivative-free minimization on a valid bracket: parabolic
/// interpolation steps with golden-section fallbacks.
fn brent_min(ev: &mut LineEval, br: &Bracket, tol: f64, maxiter: usize)
    -> (f64, f64)
{
    let (mut a, mut b) = if br.xa < br.xc {
        (br.xa, br.xc)
    } else {
        (br.xc, br.xa)
    };
    let mut x = br.xb;
    let mut w = br.xb;
    let mut v = br.xb;
    let mut fx = br.fb;
    let mut fw = br.fb;
    let mut fv = br.fb;
    let mut deltax = 0.0_f64;
    let mut rat = 0.0_f64;

    for _ in 0..maxiter {
        let tol1 = tol * x.abs() + MINTOL;
        let tol2 = 2.0 * tol1;
        let xmid = 0.5 * (a + b);
        if (x - xmid).abs() < tol2 - 0.5 * (b - a) { break; }

        if deltax.abs() <= tol1 {
            // golden-section step
            deltax = if x >= xmid { a - x } else { b - x };
            rat = CGOLD * deltax;
        } else {
            // try a parabolic fit through (v, w, x)
            let tmp1 = (x - w) * (fx - fv);
            let mut tmp2 = (x - v) * (fx - fw);
            let mut p = (x - v) * tmp2 - (x - w) * tmp1;
            tmp2 = 2.0 * (tmp2 - tmp1);
            if tmp2 > 0.0 { p = -p; }
            tmp2 = tmp2.abs();
            let dx_prev = deltax;
            deltax = rat;
            if p > tmp2 * (a - x)
                && p < tmp2 * (b - x)
                && p.abs() < (0.5 * tmp2 * dx_prev).abs()
            {
                rat = p / tmp2;
                let u = x + rat;
                if u - a < tol2 || b - u < tol2 {
                    rat = if xmid - x >= 0.0 { tol1 } else { -tol1 };
                }
            } else {
                deltax = if x >= xmid { a - x } else { b - x };
                rat = CGOLD * deltax;
            }
        }

        let u = if rat.abs() >= tol1 {
            x + rat
        } else if rat >= 0.0 {
            x + tol1
        } else {
            x - tol1
        };
        let fu = ev.eval(u);

        if fu > fx {
            if u < x { a = u; } else { b = u; }
            if fu <= fw || w == x {
                v = w;
                w = u;
                fv = fw;
                fw = fu;
            } else if fu <= fv || v == x || v == w {
                v = u;
                fv = fu;
            }
        } else {
            if u >= x { a = x; } else { b = x; }
            v = w;
            w = x;
            x = u;
            fv = fw;
            fw = fx;
            fx = fu;
        }
    }
    (x, fx)
}

/// Brent line search for a minimum of the energy along `-b`.
///
/// With `try_bracket` the candidate bracket
/// `(0.1·dtau_init, dtau_init, 2·dtau_init)` is checked first; if it does
/// not enclose a minimum a [`Diagnostic::BracketFailed`] is recorded and a
/// golden-ratio downhill search starting from
/// `(0.9·dtau_init, 1.1·dtau_init)` takes over. With `skip_if_lower` the
/// search is skipped entirely whenever a single step of `dtau_init`
/// already lowers the energy.
///
/// Fails with [`UmpsError::NoBracket`] only when no bracket can be found
/// at all (e.g. when the energy is monotone along the whole ray).
pub fn find_min_h_brent(
    s: &mut Umps,
    b: &nd::Array3<C64>,
    dtau_init: f64,
    tol: f64,
    skip_if_lower: bool,
    try_bracket: bool,
) -> UmpsResult<f64> {
    let a0 = s.a.clone();
    let h0 = s.h;
    let mut ev = LineEval {
        s,
        a0: a0.clone(),
        b,
        h0: h0.re,
        cache: Vec::new(),
    };

    let restore = |ev: &mut LineEval| {
        ev.s.a.assign(&ev.a0);
        ev.s.h = h0;
    };

    if skip_if_lower && ev.eval(dtau_init) < h0.re {
        restore(&mut ev);
        return Ok(dtau_init);
    }

    let fb_lo = dtau_init * 0.9;
    let fb_hi = dtau_init * 1.1;
    let br = if try_bracket {
        let (lo, hi) = (dtau_init * 0.1, dtau_init * 2.0);
        match verify_bracket(&mut ev, lo, dtau_init, hi) {
            Some(br) => Some(br),
            None => {
                ev.s.diags.push(Diagnostic::BracketFailed { lo, hi });
                search_bracket(&mut ev, fb_lo, fb_hi)
            },
        }
    } else {
        search_bracket(&mut ev, fb_lo, fb_hi)
    };
    let br = match br {
        Some(br) => br,
        None => {
            restore(&mut ev);
            return Err(UmpsError::NoBracket);
        },
    };

    let (tau_opt, _) = brent_min(&mut ev, &br, tol, 20);
    restore(&mut ev);
    Ok(tau_opt)
}

/// Probe whether a single Euler step of size `dtau` along `-b` lowers the
/// energy, returning the probed energy as well. The engine is restored.
pub fn step_reduces_h(s: &mut Umps, b: &nd::Array3<C64>, dtau: f64)
    -> (bool, C64)
{
    let a0 = s.a.clone();
    set_trial(&mut s.a, &a0, b, dtau);
    s.calc_lr();
    s.calc_aa();
    let h = s.eval_energy();
    s.a = a0;
    (h.re < s.h.re, h)
}

/// One accepted conjugate-gradient step.
#[derive(Clone, Debug)]
pub struct CgStep {
    /// Search direction actually used (conjugate, or the plain gradient
    /// after a reset).
    pub b_cg: nd::Array3<C64>,
    /// Plain tangent gradient at the step's starting state, for the next
    /// conjugation.
    pub b: nd::Array3<C64>,
    /// Gradient norm at the step's starting state.
    pub eta: f64,
    /// Optimal step length found by the line search.
    pub tau: f64,
}

/// Compute a Fletcher-Reeves conjugate search direction and line-search
/// along it.
///
/// `prev` carries the previous step's direction and gradient norm; `None`
/// restarts from the plain gradient. The mixing weight is
/// `β = η²/η₀²`, clipped at zero. A negative optimal step means the
/// conjugate direction has turned uphill; the direction is then reset to
/// the plain gradient and the line search repeated. With `skip_if_lower`
/// the line search is skipped entirely and `dtau_init` accepted outright
/// whenever a single step of that size already lowers the energy.
///
/// The caller applies the step itself, typically
/// `take_step(C64::from(step.tau), Some(&step.b_cg))` followed by
/// `update`.
pub fn calc_b_cg(
    s: &mut Umps,
    prev: Option<(&nd::Array3<C64>, f64)>,
    dtau_init: f64,
    tol: f64,
    skip_if_lower: bool,
    use_brent: bool,
) -> UmpsResult<CgStep> {
    let b = s.calc_b()?;
    let eta = s.eta;

    let mut b_cg = match prev {
        None => b.clone(),
        Some((b_cg_0, eta_0)) => {
            let beta = ((eta * eta) / (eta_0 * eta_0)).max(0.0);
            let mut out = b.clone();
            out.scaled_add(C64::from(beta), b_cg_0);
            out
        },
    };

    let mut tau = if skip_if_lower && step_reduces_h(s, &b_cg, dtau_init).0 {
        dtau_init
    } else if use_brent {
        find_min_h_brent(s, &b_cg, dtau_init, tol, false, false)?
    } else {
        find_min_h(s, &b_cg, dtau_init, tol)
    };

    if tau < 0.0 {
        // conjugate direction points uphill; restart from the gradient
        b_cg = b.clone();
        tau = find_min_h_brent(s, &b_cg, dtau_init, tol, false, true)?;
    }

    Ok(CgStep { b_cg, b, eta, tau })
}
