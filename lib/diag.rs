//! Structured diagnostics for recoverable numerical events.
//!
//! The iterative sub-solvers (power iteration, BiCGStab, line-search
//! bracketing) and the optional invariant checks never abort the
//! computation; they record what happened here instead. Callers that depend
//! on convergence guarantees should drain these from the engine and inspect
//! them alongside the returned convergence flags.

use std::fmt;

/// Which orientation of the transfer operator an event refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => write!(f, "left"),
            Self::Right => write!(f, "right"),
        }
    }
}

/// A recoverable numerical event.
///
/// All variants are warnings: the computation that produced one has already
/// continued with its best available iterate.
#[derive(Clone, Debug, PartialEq)]
pub enum Diagnostic {
    /// Power iteration for a dominant transfer-operator eigenvector hit its
    /// iteration cap before the successive-iterate residual fell below
    /// tolerance.
    FixedPointNoConverge { side: Side, iterations: usize, residual: f64 },

    /// The post-solve rescaling loop failed to bring ⟨l, r⟩ to 1 within its
    /// bounded number of retries.
    NormalizationStalled { iterations: usize, deviation: f64 },

    /// The BiCGStab solve for the effective energy-density operator stopped
    /// at its iteration cap or broke down.
    QuasiInverseNoConverge { side: Side, iterations: usize, residual: f64 },

    /// The first line-search bracketing attempt failed to enclose a minimum;
    /// the fallback bracket was (or will be) used.
    BracketFailed { lo: f64, hi: f64 },

    /// An optional sanity check measured a deviation above tolerance.
    InvariantViolation { check: &'static str, deviation: f64 },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixedPointNoConverge { side, iterations, residual } => {
                write!(f,
                    "{side} fixed-point power iteration unconverged after \
                    {iterations} iterations (residual {residual:e})")
            },
            Self::NormalizationStalled { iterations, deviation } => {
                write!(f,
                    "fixed-point normalization stalled after {iterations} \
                    retries (|<l,r>| off by {deviation:e})")
            },
            Self::QuasiInverseNoConverge { side, iterations, residual } => {
                write!(f,
                    "{side} quasi-inverse solve unconverged after \
                    {iterations} iterations (relative residual {residual:e})")
            },
            Self::BracketFailed { lo, hi } => {
                write!(f,
                    "line-search bracketing failed starting from \
                    ({lo}, {hi}); falling back")
            },
            Self::InvariantViolation { check, deviation } => {
                write!(f,
                    "sanity check failed: {check} off by {deviation:e}")
            },
        }
    }
}
