//! Structural invariants of the evolution engine: fixed points, canonical
//! forms, tangent-space orthogonality, and the built-in sanity checks.

use std::sync::Arc;
use ndarray as nd;
use rand::SeedableRng;
use rand::rngs::StdRng;
use umps_tdvp::{
    C64, Contraction, FixedPoint, Gauge, Umps, UmpsConfig, UmpsError,
    mat,
    umps::{ Op1, Op2 },
};

fn sign(k: usize) -> f64 { if k % 2 == 0 { 1.0 } else { -1.0 } }

fn ising(j: f64, hx: f64) -> Arc<Op2> {
    Arc::new(move |s, t, u, v| {
        let mut res = 0.0;
        if s == u && t == v { res -= j * sign(s) * sign(t); }
        if s != u && t == v { res -= hx; }
        C64::from(res)
    })
}

fn sigma_z() -> Box<Op1> {
    Box::new(|s, t| {
        if s == t { C64::from(sign(s)) } else { C64::from(0.0) }
    })
}

fn make(d: usize, gauge: Gauge, seed: u64) -> Umps {
    let cfg = UmpsConfig { gauge, ..UmpsConfig::default() };
    let mut rng = StdRng::seed_from_u64(seed);
    Umps::new(d, 2, ising(1.0, 0.5), cfg, &mut rng).unwrap()
}

#[test]
fn fixed_points_are_fixed_and_normalized() {
    let mut s = make(6, Gauge::RightCanonical, 1);
    s.calc_lr();
    let (cl, cr) = s.lr_converged();
    assert!(cl && cr);
    let l = s.l().to_dense();
    let r = s.r().to_dense();
    assert!(mat::norm_fro(&(&s.eps_l(&l) - &l)) < 1e-10);
    assert!(mat::norm_fro(&(&s.eps_r(&r) - &r)) < 1e-10);
    assert!((mat::adot(&l, &r) - 1.0).norm() < 1e-10);
}

#[test]
fn right_canonical_form_holds_after_update() {
    let mut s = make(6, Gauge::RightCanonical, 2);
    s.update().unwrap();
    // r is exactly the identity, l diagonal with unit trace
    match s.r() {
        FixedPoint::Diagonal(v) => {
            assert!(v.iter().all(|x| (x - 1.0).abs() == 0.0));
        },
        FixedPoint::Dense(_) => panic!("r not diagonal"),
    }
    let lam = match s.l() {
        FixedPoint::Diagonal(v) => v.clone(),
        FixedPoint::Dense(_) => panic!("l not diagonal"),
    };
    assert!((lam.sum() - 1.0).abs() < 1e-10);
    assert!(lam.iter().all(|x| *x > 0.0));
    let eye: nd::Array2<C64> = nd::Array2::eye(6);
    assert!(mat::norm_fro(&(&s.eps_r(&eye) - &eye)) < 1e-10);
    // Schmidt coefficients square-sum to one
    let sq: f64 = s.schmidt().unwrap().iter().map(|x| x * x).sum();
    assert!((sq - 1.0).abs() < 1e-10);
}

#[test]
fn symmetric_canonical_form_holds_after_update() {
    let mut s = make(6, Gauge::Symmetric, 3);
    s.update().unwrap();
    let (lam_l, lam_r) = match (s.l(), s.r()) {
        (FixedPoint::Diagonal(a), FixedPoint::Diagonal(b)) => (a, b),
        _ => panic!("fixed points not diagonal"),
    };
    assert_eq!(lam_l, lam_r);
    let sq: f64 = lam_r.iter().map(|x| x * x).sum();
    assert!((sq - 1.0).abs() < 1e-10);
    let sd = s.r().to_dense();
    assert!(mat::norm_fro(&(&s.eps_r(&sd) - &sd)) < 1e-10);
    assert!(mat::norm_fro(&(&s.eps_l(&sd) - &sd)) < 1e-10);
}

#[test]
fn gauge_fixing_is_idempotent_on_observables() {
    let mut s = make(6, Gauge::RightCanonical, 4);
    s.update().unwrap();
    let h0 = s.h();
    let ent0 = s.entropy();
    let lam0 = s.schmidt().unwrap();
    let z0 = s.expect_1s(sigma_z().as_ref());
    s.update().unwrap();
    assert!((s.h() - h0).norm() < 1e-10);
    assert!((s.entropy() - ent0).abs() < 1e-10);
    let lam1 = s.schmidt().unwrap();
    let dev: f64 = lam0.iter().zip(lam1.iter())
        .map(|(a, b)| (a - b).abs())
        .sum();
    assert!(dev < 1e-10);
    assert!((s.expect_1s(sigma_z().as_ref()) - z0).norm() < 1e-10);
}

#[test]
fn tangent_gradient_is_gauge_fixed() {
    let mut s = make(6, Gauge::RightCanonical, 5);
    s.update().unwrap();
    let b = s.calc_b().unwrap();
    assert!(s.eta() > 0.0);
    let r = s.r().to_dense();
    let mut tst: nd::Array2<C64> = nd::Array2::zeros((6, 6));
    for (b_s, a_s) in b.outer_iter().zip(s.site_tensor().outer_iter()) {
        tst += &b_s.dot(&r).dot(&mat::hconj(a_s));
    }
    assert!(mat::norm_fro(&tst) < 1e-10, "dev = {:e}", mat::norm_fro(&tst));
}

#[test]
fn sanity_checks_stay_silent_on_a_healthy_run() {
    let cfg = UmpsConfig { sanity_checks: true, ..UmpsConfig::default() };
    let mut rng = StdRng::seed_from_u64(6);
    let mut s = Umps::new(5, 2, ising(1.0, 0.5), cfg, &mut rng).unwrap();
    for _ in 0..3 {
        s.update().unwrap();
        let b = s.calc_b().unwrap();
        s.take_step(C64::from(0.02), Some(&b)).unwrap();
    }
    let diags = s.take_diagnostics();
    assert!(diags.is_empty(), "{diags:?}");
}

#[test]
fn product_state_has_classical_energy_and_zero_entropy() {
    let mut s = make(1, Gauge::RightCanonical, 7);
    let a = nd::array![
        [[C64::from(1.0)]],
        [[C64::from(0.0)]],
    ];
    s.set_site_tensor(a).unwrap();
    s.update().unwrap();
    assert!((s.h().re + 1.0).abs() < 1e-12, "h = {}", s.h().re);
    assert!(s.h().im.abs() < 1e-12);
    assert!(s.entropy().abs() < 1e-12);
    assert!((s.expect_1s(sigma_z().as_ref()).re - 1.0).abs() < 1e-12);
}

#[test]
fn set_site_tensor_rejects_wrong_shape() {
    let mut s = make(4, Gauge::RightCanonical, 8);
    let wrong: nd::Array3<C64> = nd::Array3::zeros((2, 3, 3));
    assert!(matches!(
        s.set_site_tensor(wrong),
        Err(UmpsError::ShapeMismatch),
    ));
}

#[test]
fn density_matrix_is_consistent_with_expectations() {
    let mut s = make(5, Gauge::RightCanonical, 9);
    s.update().unwrap();
    let rho = s.density_1s();
    let tr = rho.diag().sum();
    assert!((tr - 1.0).norm() < 1e-10);
    let z = sigma_z();
    let from_rho = (0..2).flat_map(|ss| (0..2).map(move |t| (ss, t)))
        .map(|(ss, t)| rho[[ss, t]] * z(ss, t))
        .fold(C64::from(0.0), |acc, x| acc + x);
    assert!((s.expect_1s(z.as_ref()) - from_rho).norm() < 1e-10);
}

#[test]
fn identity_operator_application_is_a_noop() {
    let mut s = make(4, Gauge::RightCanonical, 10);
    let a0 = s.site_tensor().clone();
    let ident: Box<Op1> = Box::new(|ss, t| {
        if ss == t { C64::from(1.0) } else { C64::from(0.0) }
    });
    s.apply_op_1s(ident.as_ref());
    assert_eq!(s.site_tensor(), &a0);
}

#[test]
fn threaded_contraction_matches_serial() {
    let mk = |contraction| {
        let cfg = UmpsConfig { contraction, ..UmpsConfig::default() };
        let mut rng = StdRng::seed_from_u64(11);
        Umps::new(6, 2, ising(1.0, 0.5), cfg, &mut rng).unwrap()
    };
    let mut serial = mk(Contraction::Serial);
    let mut threaded = mk(Contraction::Threaded(3));
    serial.update().unwrap();
    threaded.update().unwrap();
    assert!((serial.h() - threaded.h()).norm() < 1e-12);
    let bs = serial.calc_b().unwrap();
    let bt = threaded.calc_b().unwrap();
    let dev: f64 = bs.iter().zip(bt.iter())
        .map(|(x, y)| (x - y).norm())
        .sum();
    assert!(dev < 1e-10, "dev = {dev:e}");
}

#[test]
fn zero_dimensions_are_rejected() {
    let mut rng = StdRng::seed_from_u64(12);
    assert!(matches!(
        Umps::new(0, 2, ising(1.0, 0.5), UmpsConfig::default(), &mut rng),
        Err(UmpsError::ZeroDimension),
    ));
    assert!(matches!(
        Umps::new(4, 0, ising(1.0, 0.5), UmpsConfig::default(), &mut rng),
        Err(UmpsError::ZeroDimension),
    ));
}
