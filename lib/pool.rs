//! Scoped worker pool for the two-site Hamiltonian contraction.
//!
//! The (s, t) double loop in `C[s,t] = Σ_{u,v} h(s,t,u,v)·AA[u,v]` is
//! embarrassingly parallel: every (s, t) block is independent. Workers pull
//! block indices from a shared channel and each block is accumulated in a
//! fixed (u, v) order before being written to its own slot, so the result is
//! bit-identical to the serial loop regardless of scheduling.

use crossbeam::channel;
use itertools::Itertools;
use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::umps::Op2;

/// Build the two-site effective operator across `nthreads` workers
/// (`0` means one per logical CPU).
pub fn build_c_threaded(
    aa: &nd::Array4<C64>,
    ham: &Op2,
    nthreads: usize,
) -> nd::Array4<C64> {
    let q = aa.shape()[0];
    let d = aa.shape()[2];
    let nthreads = if nthreads == 0 { num_cpus::get() } else { nthreads };

    let (tx_in, rx_in) = channel::unbounded::<(usize, usize)>();
    let (tx_out, rx_out)
        = channel::unbounded::<(usize, usize, nd::Array2<C64>)>();
    for (s, t) in (0..q).cartesian_product(0..q) {
        tx_in.send((s, t)).expect("channel open during fill");
    }
    drop(tx_in);

    let mut c: nd::Array4<C64> = nd::Array4::zeros((q, q, d, d));
    crossbeam::thread::scope(|scope| {
        for _ in 0..nthreads {
            let rx = rx_in.clone();
            let tx = tx_out.clone();
            scope.spawn(move |_| {
                while let Ok((s, t)) = rx.recv() {
                    let mut block: nd::Array2<C64> = nd::Array2::zeros((d, d));
                    for u in 0..q {
                        for v in 0..q {
                            let hv = ham(s, t, u, v);
                            if hv != C64::new(0.0, 0.0) {
                                block.scaled_add(
                                    hv, &aa.slice(nd::s![u, v, .., ..]));
                            }
                        }
                    }
                    if tx.send((s, t, block)).is_err() { break; }
                }
            });
        }
        drop(tx_out);
        for (s, t, block) in rx_out.iter() {
            c.slice_mut(nd::s![s, t, .., ..]).assign(&block);
        }
    }).expect("contraction worker panicked");
    c
}
