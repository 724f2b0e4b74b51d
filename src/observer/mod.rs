use std::io::Write;

use crate::coordinator::Phase;

/// A read-only snapshot of what one rank is doing.
///
/// Design intent:
/// - Observers cannot mutate or steer the run; they only see copies.
/// - Snapshots are built once per sample, never inside the fine-step loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSnapshot {
    pub rank: usize,
    pub phase: Phase,
    pub fine_step: u64,
    /// Somatic voltage as known to this rank.
    pub soma_v: f64,
    /// Samples recorded so far (soma owner only).
    pub samples: usize,
    pub owned_dendrites: usize,
}

/// Hooks called by the coordinator between fine-step rounds.
pub trait SimObserver {
    fn on_phase(&mut self, _rank: usize, _phase: Phase) {}

    /// Called by the soma owner after each millisecond sample.
    fn on_sample(&mut self, _ms: u32, _snapshot: &RunSnapshot) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl SimObserver for NullObserver {}

/// Prints a `\rNN ms` progress line, the way a terminal batch run reports.
pub struct ProgressObserver<W: Write> {
    out: W,
}

impl<W: Write> ProgressObserver<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> SimObserver for ProgressObserver<W> {
    fn on_phase(&mut self, _rank: usize, phase: Phase) {
        if phase == Phase::Reporting {
            let _ = writeln!(self.out);
        }
    }

    fn on_sample(&mut self, ms: u32, _snapshot: &RunSnapshot) {
        if ms == 0 {
            return;
        }
        // Progress is cosmetic; a closed terminal must not stop the run.
        let _ = write!(self.out, "\r{ms:02} ms");
        let _ = self.out.flush();
    }
}

/// Keeps every snapshot it is shown.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    pub phases: Vec<(usize, Phase)>,
    pub samples: Vec<(u32, RunSnapshot)>,
}

impl SimObserver for RecordingObserver {
    fn on_phase(&mut self, rank: usize, phase: Phase) {
        self.phases.push((rank, phase));
    }

    fn on_sample(&mut self, ms: u32, snapshot: &RunSnapshot) {
        self.samples.push((ms, *snapshot));
    }
}
