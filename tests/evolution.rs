//! End-to-end evolution: imaginary-time ground-state search for the
//! transverse-field Ising chain, Runge-Kutta stepping, persistence, and
//! bond-dimension growth.

use std::sync::Arc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use umps_tdvp::{
    C64, Umps, UmpsConfig, UmpsError,
    umps::Op2,
};

fn ising(j: f64, hx: f64) -> Arc<Op2> {
    Arc::new(move |s, t, u, v| {
        let sign = |k: usize| if k % 2 == 0 { 1.0 } else { -1.0 };
        let mut res = 0.0;
        if s == u && t == v { res -= j * sign(s) * sign(t); }
        if s != u && t == v { res -= hx; }
        C64::from(res)
    })
}

fn make(d: usize, seed: u64) -> Umps {
    let mut rng = StdRng::seed_from_u64(seed);
    Umps::new(d, 2, ising(1.0, 0.5), UmpsConfig::default(), &mut rng)
        .unwrap()
}

#[test]
fn euler_descent_approaches_ising_ground_state() {
    let mut s = make(4, 21);
    s.update().unwrap();
    let h_start = s.h().re;
    let mut h_prev = h_start;
    let mut eta_mid = 0.0;
    for n in 0..300 {
        s.take_step(C64::from(0.04), None).unwrap();
        s.update().unwrap();
        // descent is monotone step over step, not just end to end
        assert!(
            s.h().re <= h_prev + 1e-9,
            "h rose at step {n}: {h_prev} -> {}", s.h().re,
        );
        h_prev = s.h().re;
        if n == 50 { eta_mid = s.eta(); }
    }
    let h_end = s.h().re;
    assert!(h_end < h_start);
    // below the classical (product-state) energy of -1: the transverse
    // field only lowers the ground-state energy density
    assert!(h_end < -1.01, "h = {h_end}");
    assert!(s.h().im.abs() < 1e-8);
    assert!(s.eta() < eta_mid, "eta {} -> {}", eta_mid, s.eta());
    assert!(s.entropy() > 0.0);
}

#[test]
fn rk4_steps_descend() {
    let mut s = make(4, 22);
    s.update().unwrap();
    let h_start = s.h().re;
    for _ in 0..20 {
        s.take_step_rk4(C64::from(0.05), None).unwrap();
        s.update().unwrap();
    }
    assert!(s.h().re < h_start, "h {h_start} -> {}", s.h().re);
    assert!(s.h().re.is_finite());
}

#[test]
fn save_load_round_trip() {
    let path = std::env::temp_dir().join("umps-tdvp-roundtrip.npz");
    let mut saved = make(4, 23);
    saved.update().unwrap();
    saved.set_userdata(Some(ndarray::array![C64::from(42.0)]));
    saved.save_state(&path, None).unwrap();

    let mut loaded = make(4, 24);
    assert!(loaded.load_state(&path, false, false).unwrap());
    assert_eq!(loaded.site_tensor(), saved.site_tensor());
    assert_eq!(loaded.k(), saved.k());
    assert_eq!(
        loaded.userdata().unwrap(),
        &ndarray::array![C64::from(42.0)],
    );
    loaded.update().unwrap();
    assert!((loaded.h() - saved.h()).norm() < 1e-10);

    std::fs::remove_file(&path).ok();
}

#[test]
fn load_rejects_mismatched_shapes_without_mutation() {
    let path = std::env::temp_dir().join("umps-tdvp-mismatch.npz");
    let saved = make(3, 25);
    saved.save_state(&path, None).unwrap();

    let mut other = make(5, 26);
    let a_before = other.site_tensor().clone();
    assert!(!other.load_state(&path, false, false).unwrap());
    assert_eq!(other.site_tensor(), &a_before);
    assert_eq!(other.dim(), 5);

    std::fs::remove_file(&path).ok();
}

#[test]
fn load_with_expansion_grows_the_bond_dimension() {
    let path = std::env::temp_dir().join("umps-tdvp-expand.npz");
    let mut saved = make(3, 27);
    saved.update().unwrap();
    saved.save_state(&path, None).unwrap();

    let mut grown = make(6, 28);
    assert!(grown.load_state(&path, true, false).unwrap());
    assert_eq!(grown.dim(), 6);
    assert_eq!(grown.phys_dim(), 2);
    let block = grown.site_tensor().slice(ndarray::s![.., ..3, ..3]);
    assert_eq!(&block, saved.site_tensor());
    grown.update().unwrap();
    assert!(grown.h().re.is_finite());

    std::fs::remove_file(&path).ok();
}

#[test]
fn expand_d_preserves_the_old_block() {
    let mut s = make(3, 29);
    s.update().unwrap();
    let h0 = s.h().re;
    let a0 = s.site_tensor().clone();
    let mut rng = StdRng::seed_from_u64(30);
    s.expand_d(5, &mut rng).unwrap();
    assert_eq!(s.dim(), 5);
    let block = s.site_tensor().slice(ndarray::s![.., ..3, ..3]);
    assert_eq!(&block, &a0);
    s.update().unwrap();
    // small off-block seeds only weakly perturb the energy
    assert!((s.h().re - h0).abs() < 0.5, "h {h0} -> {}", s.h().re);
    assert!(matches!(
        s.expand_d(2, &mut rng),
        Err(UmpsError::ShrinkExpansion),
    ));
}

#[test]
fn expand_q_zero_fills_new_site_matrices() {
    let mut s = make(3, 31);
    let a0 = s.site_tensor().clone();
    s.expand_q(3).unwrap();
    assert_eq!(s.phys_dim(), 3);
    assert_eq!(&s.site_tensor().slice(ndarray::s![..2, .., ..]), &a0);
    assert!(
        s.site_tensor().slice(ndarray::s![2, .., ..]).iter()
            .all(|z| z.norm() == 0.0)
    );
}

#[test]
fn fuzzing_perturbs_weakly() {
    let mut s = make(4, 32);
    let a0 = s.site_tensor().clone();
    let norm0 = umps_tdvp::mat::norm_fro(&a0);
    let mut rng = StdRng::seed_from_u64(33);
    s.fuzz_state(1e-3, &mut rng);
    let diff = umps_tdvp::mat::norm_fro(&(s.site_tensor() - &a0));
    assert!(diff > 0.0);
    assert!(diff < 1e-2 * norm0, "diff = {diff:e}");
}
