//! Passive dendrite compartments and the per-step dendrite stepper.
//!
//! A dendrite is a chain of `compartments + 2` voltage slots:
//!
//! ```text
//! [ dummy | tip ... soma-adjacent | soma ]
//!     0     1 ..        compartments   compartments + 1
//! ```
//!
//! Slot 0 is a boundary placeholder (its conductance is always zero) and the
//! last slot mirrors the somatic voltage for the current fine step.
//!
//! The stepper couples neighbouring compartments explicitly: pass 1 evaluates
//! every compartment's derivative against the pre-step voltages, pass 2 runs
//! one RK4 step per compartment against those same pre-step neighbours, and
//! only then are the new voltages committed. No tri-diagonal solve is needed.

use crate::config::{DENDRCONDCOMP, DENDRCONDDISTR, INJCURMEAN, VREST};
use crate::prng::Prng;
use crate::rk4::rk4_step;

/// Leak conductance of one dendrite compartment, nS.
pub const G_LD: f64 = 0.01;
/// Capacitance of one dendrite compartment, pF.
pub const C_D: f64 = 0.1;
/// Leak reversal potential, mV.
pub const E_L: f64 = -65.0;

/// Transient inputs of one compartment for one fine step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompartmentParams {
    pub dt: f64,
    /// Injected current, pA.
    pub i_injected: f64,
    /// Conductance towards the tip, nS.
    pub g_left: f64,
    /// Conductance towards the soma, nS.
    pub g_right: f64,
    pub v_left: f64,
    pub v_right: f64,
}

/// Discretized cable equation for a single passive compartment, scaled by `dt`.
#[inline]
pub fn compartment_derivative(v: f64, p: &CompartmentParams) -> f64 {
    p.dt * (p.i_injected + p.g_left * p.v_left - (p.g_left + p.g_right) * v + p.g_right * p.v_right
        - G_LD * (v - E_L))
        / C_D
}

/// Lateral conductance `distance` compartments away from the soma
/// (1 = soma-adjacent). The model constants are integers and the distance term
/// truncates, so the conductance only changes over the last hundred compartments.
#[inline]
pub fn lateral_conductance(distance: usize) -> f64 {
    debug_assert!(distance > 0);
    let distance = u32::try_from(distance).unwrap_or(u32::MAX);
    (DENDRCONDCOMP + DENDRCONDDISTR / distance) as f64
}

/// Seed of the tip-current draw for one dendrite in one fine step.
#[inline]
pub fn tip_seed(step_in_ms: u32, dendrite: usize) -> u64 {
    step_in_ms as u64 + dendrite as u64 + 1
}

/// Uniform current in `INJCURMEAN +/- 10%`, reproducible for a given seed.
#[inline]
pub fn tip_current(seed: u64) -> f64 {
    let spread = INJCURMEAN * 0.1;
    // Drawn downwards from the upper bound: u = 0 gives mean + 10%.
    Prng::new(seed).gen_range_f64(INJCURMEAN + spread, INJCURMEAN - spread)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DendriteChain {
    voltages: Vec<f64>,
}

impl DendriteChain {
    /// A chain with every slot at the resting potential.
    pub fn new(compartments: usize) -> Self {
        assert!(compartments > 0, "a dendrite needs at least one compartment");
        Self {
            voltages: vec![VREST; compartments + 2],
        }
    }

    #[inline]
    pub fn compartments(&self) -> usize {
        self.voltages.len() - 2
    }

    /// All slots, boundaries included.
    pub fn voltages(&self) -> &[f64] {
        &self.voltages
    }

    /// Voltage of the soma-adjacent compartment.
    #[inline]
    pub fn last_compartment(&self) -> f64 {
        self.voltages[self.voltages.len() - 2]
    }

    /// Inputs of compartment `i` (0 = tip) for the current slot voltages.
    fn params(&self, i: usize, dt: f64, i_tip: f64) -> CompartmentParams {
        let n = self.compartments();
        let g_right = lateral_conductance(n - i);
        let (i_injected, g_left) = if i == 0 {
            // The tip has no resistance to the left.
            (i_tip, 0.0)
        } else {
            (0.0, lateral_conductance(n - i + 1))
        };
        CompartmentParams {
            dt,
            i_injected,
            g_left,
            g_right,
            v_left: self.voltages[i],
            v_right: self.voltages[i + 2],
        }
    }

    /// Advance the chain by one fine step against somatic voltage `v_soma`.
    ///
    /// Returns the current this dendrite injects into the soma.
    pub fn step(&mut self, seed: u64, dt: f64, v_soma: f64) -> f64 {
        let n = self.compartments();
        let i_tip = tip_current(seed);

        let last = self.voltages.len() - 1;
        self.voltages[last] = v_soma;

        // Pass 1: lateral derivatives at the pre-step voltages.
        let mut params = Vec::with_capacity(n);
        let mut dvdt = Vec::with_capacity(n);
        for i in 0..n {
            let p = self.params(i, dt, i_tip);
            dvdt.push(compartment_derivative(self.voltages[i + 1], &p));
            params.push(p);
        }

        // Pass 2: RK4 per compartment, neighbours held at pre-step values.
        let mut next = Vec::with_capacity(n);
        for i in 0..n {
            let p = &params[i];
            let [v] = rk4_step(&[self.voltages[i + 1]], &[dvdt[i]], 1.0, |y| {
                [compartment_derivative(y[0], p)]
            });
            next.push(v);
        }
        self.voltages[1..=n].copy_from_slice(&next);

        lateral_conductance(1) * (self.last_compartment() - v_soma)
    }
}
