//! Ground states and dynamics of infinite, translation-invariant 1-D spin
//! chains with uniform matrix product states, evolved by the time-dependent
//! variational principle (TDVP).
//!
//! The central type is [`Umps`]: one repeating site tensor plus the derived
//! quantities (transfer-operator fixed points, effective Hamiltonian and
//! energy-density operators, tangent-space gradient) needed to evolve it.
//! [`opt`] adds line searches and nonlinear conjugate-gradient acceleration
//! on top of the basic Euler and Runge-Kutta steppers.
//!
//! Hamiltonians and observables enter as plain element callbacks
//! ([`Op1`], [`Op2`]); see the [`umps`] module docs for a worked
//! transverse-field Ising example.

pub mod mat;
pub mod diag;
pub mod gauge;
pub mod bicgstab;
pub mod pool;
pub mod umps;
pub mod opt;

pub use num_complex::Complex64 as C64;
pub use bicgstab::{ LinearOp, SolveReport };
pub use diag::{ Diagnostic, Side };
pub use gauge::{ FixedPoint, Gauge };
pub use umps::{
    Contraction,
    Op1,
    Op2,
    Umps,
    UmpsConfig,
    UmpsError,
    UmpsResult,
};
pub use opt::CgStep;
