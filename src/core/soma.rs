//! Hodgkin-Huxley soma.
//!
//! Parameters describe a cell of 20,000 um^2 surface area (2e-4 cm^2).
//! Derivatives are returned pre-scaled by the integration step `dt`, so the
//! integrator advances them with a unit step.

use crate::config::VREST;
use crate::rk4::rk4_step;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Leak conductance, nS.
pub const G_L: f64 = 10.0;
/// Potassium conductance, nS.
pub const G_K: f64 = 6000.0;
/// Sodium conductance, nS.
pub const G_NA: f64 = 20000.0;
/// Soma capacitance, pF.
pub const C_S: f64 = 200.0;
/// Sodium reversal potential, mV.
pub const E_NA: f64 = 50.0;
/// Potassium reversal potential, mV.
pub const E_K: f64 = -90.0;
/// Leak reversal potential, mV.
pub const E_L: f64 = -65.0;

// Rate-function offsets, relative to the resting potential.
pub const E_ALPHA_N: f64 = VREST + 15.0;
pub const E_BETA_N: f64 = VREST + 10.0;
pub const E_ALPHA_M: f64 = VREST + 13.0;
pub const E_BETA_M: f64 = VREST + 40.0;
pub const E_ALPHA_H: f64 = VREST + 17.0;
pub const E_BETA_H: f64 = VREST + 40.0;

// Limits of x / (exp(x / k) - 1) at x = 0, scaled by each rate's gain.
pub const ALPHA_N_LIMIT: f64 = 0.032 * 5.0;
pub const ALPHA_M_LIMIT: f64 = 0.32 * 4.0;
pub const BETA_M_LIMIT: f64 = 0.28 * 5.0;

/// Number of state variables: V, n, m, h.
pub const SOMA_VARS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SomaState {
    /// Membrane potential, mV.
    pub v: f64,
    pub n: f64,
    pub m: f64,
    pub h: f64,
}

impl SomaState {
    /// Precomputed resting values of the HH model.
    pub const RESTING: SomaState = SomaState {
        v: VREST,
        n: 0.037,
        m: 0.0148,
        h: 0.9959,
    };

    #[inline]
    pub fn to_array(self) -> [f64; SOMA_VARS] {
        [self.v, self.n, self.m, self.h]
    }

    #[inline]
    pub fn from_array(y: [f64; SOMA_VARS]) -> Self {
        Self {
            v: y[0],
            n: y[1],
            m: y[2],
            h: y[3],
        }
    }

    pub fn is_finite(&self) -> bool {
        self.v.is_finite() && self.n.is_finite() && self.m.is_finite() && self.h.is_finite()
    }

    /// Advance by one fine step with the given currents.
    pub fn advance(&mut self, params: &SomaParams) {
        let y0 = self.to_array();
        let dydt0 = derivative(&y0, params);
        let y = rk4_step(&y0, &dydt0, 1.0, |y| derivative(y, params));
        *self = Self::from_array(y);
    }
}

impl Default for SomaState {
    fn default() -> Self {
        Self::RESTING
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SomaParams {
    /// Integration step, ms.
    pub dt: f64,
    /// Current injected directly into the soma, pA. Always zero in this model.
    pub i_direct: f64,
    /// Sum of all dendrite currents for the current fine step, pA.
    pub i_dendritic: f64,
}

impl SomaParams {
    pub fn new(dt: f64) -> Self {
        Self {
            dt,
            i_direct: 0.0,
            i_dendritic: 0.0,
        }
    }
}

#[inline]
pub fn alpha_n(v: f64) -> f64 {
    if v == E_ALPHA_N {
        return ALPHA_N_LIMIT;
    }
    0.032 * (E_ALPHA_N - v) / (((E_ALPHA_N - v) / 5.0).exp() - 1.0)
}

#[inline]
pub fn beta_n(v: f64) -> f64 {
    0.5 * ((E_BETA_N - v) / 40.0).exp()
}

#[inline]
pub fn alpha_m(v: f64) -> f64 {
    if v == E_ALPHA_M {
        return ALPHA_M_LIMIT;
    }
    0.32 * (E_ALPHA_M - v) / (((E_ALPHA_M - v) / 4.0).exp() - 1.0)
}

#[inline]
pub fn beta_m(v: f64) -> f64 {
    if v == E_BETA_M {
        return BETA_M_LIMIT;
    }
    0.28 * (v - E_BETA_M) / (((v - E_BETA_M) / 5.0).exp() - 1.0)
}

#[inline]
pub fn alpha_h(v: f64) -> f64 {
    0.128 * ((E_ALPHA_H - v) / 18.0).exp()
}

#[inline]
pub fn beta_h(v: f64) -> f64 {
    4.0 / (((E_BETA_H - v) / 5.0).exp() + 1.0)
}

/// HH right-hand side for `[V, n, m, h]`, scaled by `params.dt`.
pub fn derivative(y: &[f64; SOMA_VARS], params: &SomaParams) -> [f64; SOMA_VARS] {
    let [v, n, m, h] = *y;
    let dt = params.dt;

    let n4 = n * n * n * n;
    let m3h = m * m * m * h;

    let dv = dt
        * (params.i_direct + params.i_dendritic
            - G_K * n4 * (v - E_K)
            - G_NA * m3h * (v - E_NA)
            - G_L * (v - E_L))
        / C_S;

    let dn = dt * (alpha_n(v) * (1.0 - n) - beta_n(v) * n);
    let dm = dt * (alpha_m(v) * (1.0 - m) - beta_m(v) * m);
    let dh = dt * (alpha_h(v) * (1.0 - h) - beta_h(v) * h);

    [dv, dn, dm, dh]
}
