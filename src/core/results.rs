//! Per-millisecond samples of the somatic voltage.

use std::time::Duration;

use crate::config::SimConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ResultSeries {
    samples: Vec<f64>,
    capacity: usize,
}

impl ResultSeries {
    /// Series holding one sample for each of `duration_ms` milliseconds.
    pub fn new(duration_ms: u32) -> Self {
        let capacity = duration_ms as usize;
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append the sample for the next millisecond. Returns `false` once full.
    pub fn push(&mut self, v: f64) -> bool {
        if self.is_full() {
            return false;
        }
        self.samples.push(v);
        true
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, ms: usize) -> Option<f64> {
        self.samples.get(ms).copied()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.samples
    }

    /// `(millisecond, voltage)` pairs in increasing time order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.samples
            .iter()
            .enumerate()
            .map(|(ms, &v)| (ms as u32, v))
    }
}

/// Everything the soma owner hands to the output collaborators.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub config: SimConfig,
    pub processes: usize,
    pub series: ResultSeries,
    /// Wall time from the first fine step to the last sample.
    pub exec_time: Duration,
    pub fine_steps: u64,
}
