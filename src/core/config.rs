//! Run configuration and model constants.

use crate::error::ConfigError;
use crate::soma::SomaState;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Fine integration steps per simulated millisecond.
pub const STEPS: u32 = 10_000;
/// Simulated time, ms.
pub const COMPTIME: u32 = 100;
/// Resting membrane potential, mV.
pub const VREST: f64 = -65.0;
/// Mean current injected at a dendrite tip, pA.
pub const INJCURMEAN: f64 = 100.0;
/// Lateral compartmental conductance, nS.
pub const DENDRCONDCOMP: u32 = 1000;
/// Distance-dependent part of the lateral conductance, nS.
pub const DENDRCONDDISTR: u32 = 100;

/// Which ranks integrate dendrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum OwnerPolicy {
    /// The soma owner (rank 0) also integrates its share of dendrites.
    #[default]
    SharesDendrites,
    /// Rank 0 only advances the soma; dendrites go to ranks 1..size.
    Dedicated,
}

impl OwnerPolicy {
    /// Smallest process group that can run under this policy.
    pub fn min_processes(self) -> usize {
        match self {
            OwnerPolicy::SharesDendrites => 1,
            OwnerPolicy::Dedicated => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SimConfig {
    pub dendrites: usize,
    /// Real compartments per dendrite (boundary slots not included).
    pub compartments: usize,

    pub steps_per_ms: u32,
    pub duration_ms: u32,

    pub initial_soma: SomaState,
    pub owner_policy: OwnerPolicy,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            dendrites: 1,
            compartments: 1,
            steps_per_ms: STEPS,
            duration_ms: COMPTIME,
            initial_soma: SomaState::RESTING,
            owner_policy: OwnerPolicy::SharesDendrites,
        }
    }
}

impl SimConfig {
    pub fn with_size(dendrites: usize, compartments: usize) -> Self {
        Self {
            dendrites,
            compartments,
            ..Self::default()
        }
    }

    pub fn with_timing(mut self, steps_per_ms: u32, duration_ms: u32) -> Self {
        self.steps_per_ms = steps_per_ms;
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_initial_soma(mut self, soma: SomaState) -> Self {
        self.initial_soma = soma;
        self
    }

    pub fn with_owner_policy(mut self, policy: OwnerPolicy) -> Self {
        self.owner_policy = policy;
        self
    }

    /// Fine integration step, ms.
    #[inline]
    pub fn dt(&self) -> f64 {
        1.0 / self.steps_per_ms as f64
    }

    /// Fine steps integrated over the whole run. Millisecond 0 is the
    /// initial state, so only `duration_ms - 1` milliseconds are stepped.
    pub fn total_fine_steps(&self) -> u64 {
        self.duration_ms.saturating_sub(1) as u64 * self.steps_per_ms as u64
    }

    pub fn validate(&self, processes: usize) -> Result<(), ConfigError> {
        if self.dendrites == 0 {
            return Err(ConfigError::NoDendrites);
        }
        if self.compartments == 0 {
            return Err(ConfigError::NoCompartments);
        }
        if self.steps_per_ms == 0 {
            return Err(ConfigError::NoSteps);
        }
        if self.duration_ms == 0 {
            return Err(ConfigError::NoDuration);
        }
        if !self.initial_soma.is_finite() {
            return Err(ConfigError::NonFiniteInitialState(self.initial_soma));
        }
        let required = self.owner_policy.min_processes();
        if processes < required {
            return Err(ConfigError::TooFewProcesses {
                policy: self.owner_policy,
                required,
                got: processes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_model_constants() {
        let cfg = SimConfig::default();
        assert_eq!(cfg.dendrites, 1);
        assert_eq!(cfg.compartments, 1);
        assert_eq!(cfg.steps_per_ms, STEPS);
        assert_eq!(cfg.duration_ms, COMPTIME);
        assert_eq!(cfg.dt(), 1.0 / 10_000.0);
        assert_eq!(cfg.total_fine_steps(), 99 * 10_000);
    }

    #[test]
    fn zero_counts_are_rejected() {
        assert_eq!(
            SimConfig::with_size(0, 1).validate(1),
            Err(ConfigError::NoDendrites)
        );
        assert_eq!(
            SimConfig::with_size(1, 0).validate(1),
            Err(ConfigError::NoCompartments)
        );
        assert_eq!(
            SimConfig::default().with_timing(0, 10).validate(1),
            Err(ConfigError::NoSteps)
        );
    }

    #[test]
    fn dedicated_owner_needs_a_worker() {
        let cfg = SimConfig::with_size(4, 2).with_owner_policy(OwnerPolicy::Dedicated);
        assert!(matches!(
            cfg.validate(1),
            Err(ConfigError::TooFewProcesses { required: 2, got: 1, .. })
        ));
        assert!(cfg.validate(2).is_ok());
        assert!(SimConfig::with_size(4, 2).validate(1).is_ok());
        assert!(matches!(
            SimConfig::default().validate(0),
            Err(ConfigError::TooFewProcesses { .. })
        ));
    }

    #[test]
    fn non_finite_initial_state_is_rejected() {
        let mut soma = SomaState::RESTING;
        soma.v = f64::NAN;
        let cfg = SimConfig::default().with_initial_soma(soma);
        assert!(matches!(
            cfg.validate(1),
            Err(ConfigError::NonFiniteInitialState(_))
        ));
    }
}
