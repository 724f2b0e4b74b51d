//! Per-process driver of the distributed simulation.
//!
//! Every rank runs the same [`Coordinator`]. Rank 0 owns the soma and the
//! result series; every rank (rank 0 included, unless the owner policy is
//! `Dedicated`) owns a contiguous range of dendrites.
//!
//! One fine step is a strict barrier with two suspension points:
//!
//! 1. the soma owner broadcasts the somatic voltage (skipped on step 0, where
//!    every rank already holds the initial value) and workers block on it;
//! 2. every rank integrates its dendrites, workers send their summed current,
//!    and the soma owner blocks until it has one value from every worker,
//!    then advances the soma.
//!
//! Step `k + 1` is never broadcast before every current of step `k` has been
//! consumed, and every hot-loop message carries its step index.

use std::ops::Range;
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info};

use crate::assignment::{Assignment, SOMA_OWNER};
use crate::comm::{Communicator, LocalGroup, Message};
use crate::config::SimConfig;
use crate::dendrite::{tip_seed, DendriteChain};
use crate::error::{CommError, Result, SimError};
use crate::observer::{NullObserver, RunSnapshot, SimObserver};
use crate::results::{ResultSeries, RunReport};
use crate::soma::{SomaParams, SomaState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Distributing,
    Stepping,
    Sampling,
    Reporting,
    Terminated,
}

/// What a rank has to show for a completed run.
#[derive(Debug)]
pub enum ProcessOutcome {
    Owner(RunReport),
    Worker { rank: usize, dendrites: usize },
}

impl ProcessOutcome {
    pub fn into_report(self) -> Option<RunReport> {
        match self {
            ProcessOutcome::Owner(report) => Some(report),
            ProcessOutcome::Worker { .. } => None,
        }
    }
}

#[derive(Debug)]
struct OwnedDendrite {
    index: usize,
    chain: DendriteChain,
}

/// State only the soma owner allocates.
#[derive(Debug)]
struct SomaCore {
    state: SomaState,
    params: SomaParams,
    series: ResultSeries,
}

pub struct Coordinator<C: Communicator> {
    cfg: SimConfig,
    comm: C,
    phase: Phase,
    assignment: Assignment,
    dendrites: Vec<OwnedDendrite>,
    // Somatic voltage as last committed by (or received from) the soma owner.
    v_soma: f64,
    soma: Option<SomaCore>,
    // Global fine-step index.
    step: u64,
}

impl<C: Communicator> Coordinator<C> {
    /// Determine this rank's role and allocate its state.
    pub fn new(cfg: SimConfig, comm: C) -> Result<Self> {
        let size = comm.size();
        cfg.validate(size)?;

        let rank = comm.rank();
        let assignment = Assignment::compute(cfg.dendrites, size, cfg.owner_policy);
        let dendrites = assignment
            .range(rank)
            .map(|index| OwnedDendrite {
                index,
                chain: DendriteChain::new(cfg.compartments),
            })
            .collect();

        let soma = (rank == SOMA_OWNER).then(|| SomaCore {
            state: cfg.initial_soma,
            params: SomaParams::new(cfg.dt()),
            series: ResultSeries::new(cfg.duration_ms),
        });

        Ok(Self {
            v_soma: cfg.initial_soma.v,
            cfg,
            comm,
            phase: Phase::Initializing,
            assignment,
            dendrites,
            soma,
            step: 0,
        })
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_soma_owner(&self) -> bool {
        self.rank() == SOMA_OWNER
    }

    /// Global indices of the dendrites this rank integrates.
    pub fn owned_dendrites(&self) -> Range<usize> {
        self.assignment.range(self.rank())
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            rank: self.rank(),
            phase: self.phase,
            fine_step: self.step,
            soma_v: self.v_soma,
            samples: self.soma.as_ref().map_or(0, |s| s.series.len()),
            owned_dendrites: self.dendrites.len(),
        }
    }

    /// Run every phase to termination.
    ///
    /// On failure the peers are told to abort before the error is returned,
    /// so no rank is left blocked in the barrier.
    pub fn run<O: SimObserver + ?Sized>(mut self, observer: &mut O) -> Result<ProcessOutcome> {
        match self.run_phases(observer) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(rank = self.rank(), phase = ?self.phase, "run failed: {err}");
                self.abort_peers(&err);
                Err(err)
            }
        }
    }

    fn run_phases<O: SimObserver + ?Sized>(&mut self, observer: &mut O) -> Result<ProcessOutcome> {
        info!(
            rank = self.rank(),
            size = self.comm.size(),
            dendrites = ?self.owned_dendrites(),
            soma_owner = self.is_soma_owner(),
            "initialized"
        );

        self.enter(Phase::Distributing, observer);
        self.distribute()?;

        let started = Instant::now();

        // Millisecond 0 is the initial state.
        self.enter(Phase::Sampling, observer);
        self.sample(observer);

        for _ms in 1..self.cfg.duration_ms {
            self.enter(Phase::Stepping, observer);
            for step_in_ms in 0..self.cfg.steps_per_ms {
                self.fine_step(step_in_ms)?;
            }
            self.enter(Phase::Sampling, observer);
            self.sample(observer);
        }

        let exec_time = started.elapsed();
        self.enter(Phase::Reporting, observer);

        let outcome = match self.soma.take() {
            Some(core) => {
                info!(
                    fine_steps = self.step,
                    exec_secs = exec_time.as_secs_f64(),
                    final_v = core.state.v,
                    "simulation finished"
                );
                ProcessOutcome::Owner(RunReport {
                    config: self.cfg,
                    processes: self.comm.size(),
                    series: core.series,
                    exec_time,
                    fine_steps: self.step,
                })
            }
            None => ProcessOutcome::Worker {
                rank: self.rank(),
                dendrites: self.dendrites.len(),
            },
        };
        // Chains are released here; only copies ever left this rank.
        self.dendrites.clear();

        self.terminate()?;
        self.enter(Phase::Terminated, observer);
        Ok(outcome)
    }

    fn enter<O: SimObserver + ?Sized>(&mut self, phase: Phase, observer: &mut O) {
        if self.phase != phase {
            debug!(rank = self.rank(), from = ?self.phase, to = ?phase, "phase");
            self.phase = phase;
            observer.on_phase(self.rank(), phase);
        }
    }

    fn distribute(&mut self) -> Result<()> {
        if self.is_soma_owner() {
            for worker in 1..self.comm.size() {
                let range = self.assignment.range(worker);
                self.comm.send(
                    worker,
                    Message::Assign {
                        first: range.start,
                        count: range.len(),
                    },
                )?;
            }
            return Ok(());
        }

        let computed = self.owned_dendrites();
        match self.recv_from_owner()? {
            Message::Assign { first, count } => {
                if (first, count) != (computed.start, computed.len()) {
                    return Err(CommError::AssignmentMismatch {
                        rank: self.rank(),
                        computed: (computed.start, computed.len()),
                        granted: (first, count),
                    }
                    .into());
                }
                debug!(rank = self.rank(), first, count, "assignment confirmed");
                Ok(())
            }
            other => Err(unexpected(SOMA_OWNER, "assign", &other)),
        }
    }

    fn fine_step(&mut self, step_in_ms: u32) -> Result<()> {
        let step = self.step;

        if step > 0 {
            if self.is_soma_owner() {
                self.broadcast_voltage(step)?;
            } else {
                self.receive_voltage(step)?;
            }
        }

        let local = self.integrate_dendrites(step_in_ms);

        if self.is_soma_owner() {
            let total = self.reduce_currents(step, local)?;
            self.advance_soma(step, total)?;
        } else {
            self.comm.send(
                SOMA_OWNER,
                Message::Current {
                    step,
                    amps: local,
                },
            )?;
        }

        self.step += 1;
        Ok(())
    }

    /// Advance every owned dendrite and sum the currents they inject.
    fn integrate_dendrites(&mut self, step_in_ms: u32) -> f64 {
        let dt = self.cfg.dt();
        let v_soma = self.v_soma;
        self.dendrites
            .iter_mut()
            .map(|d| d.chain.step(tip_seed(step_in_ms, d.index), dt, v_soma))
            .sum()
    }

    fn broadcast_voltage(&mut self, step: u64) -> Result<()> {
        let mv = self.v_soma;
        for worker in 1..self.comm.size() {
            self.comm.send(worker, Message::SomaVoltage { step, mv })?;
        }
        Ok(())
    }

    fn receive_voltage(&mut self, step: u64) -> Result<()> {
        match self.recv_from_owner()? {
            Message::SomaVoltage { step: got, mv } if got == step => {
                self.v_soma = mv;
                Ok(())
            }
            Message::SomaVoltage { step: got, .. } => Err(CommError::OutOfStep {
                peer: SOMA_OWNER,
                expected: step,
                got,
            }
            .into()),
            other => Err(unexpected(SOMA_OWNER, "soma-voltage", &other)),
        }
    }

    /// Sum the local current with one value per worker, in rank order, so
    /// the total does not depend on which worker finished first.
    fn reduce_currents(&mut self, step: u64, local: f64) -> Result<f64> {
        let mut total = local;
        for worker in 1..self.comm.size() {
            match self.comm.recv(worker)? {
                Message::Current { step: got, amps } if got == step => total += amps,
                Message::Current { step: got, .. } => {
                    return Err(CommError::OutOfStep {
                        peer: worker,
                        expected: step,
                        got,
                    }
                    .into())
                }
                Message::Abort { reason } => {
                    return Err(SimError::PeerAborted {
                        rank: worker,
                        reason,
                    })
                }
                other => return Err(unexpected(worker, "current", &other)),
            }
        }
        Ok(total)
    }

    fn advance_soma(&mut self, step: u64, i_dendritic: f64) -> Result<()> {
        let Some(core) = self.soma.as_mut() else {
            return Ok(());
        };
        core.params.i_dendritic = i_dendritic;
        core.state.advance(&core.params);
        if !core.state.is_finite() {
            return Err(SimError::Divergence {
                step,
                state: core.state,
            });
        }
        self.v_soma = core.state.v;
        Ok(())
    }

    fn sample<O: SimObserver + ?Sized>(&mut self, observer: &mut O) {
        let Some(core) = self.soma.as_mut() else {
            return;
        };
        let ms = core.series.len();
        core.series.push(core.state.v);
        debug!(ms, v = core.state.v, "sample");
        let snapshot = self.snapshot();
        observer.on_sample(ms as u32, &snapshot);
    }

    fn terminate(&mut self) -> Result<()> {
        if self.is_soma_owner() {
            for worker in 1..self.comm.size() {
                self.comm.send(worker, Message::Shutdown)?;
            }
            return Ok(());
        }
        match self.recv_from_owner()? {
            Message::Shutdown => Ok(()),
            other => Err(unexpected(SOMA_OWNER, "shutdown", &other)),
        }
    }

    fn recv_from_owner(&mut self) -> Result<Message> {
        match self.comm.recv(SOMA_OWNER)? {
            Message::Abort { reason } => Err(SimError::PeerAborted {
                rank: SOMA_OWNER,
                reason,
            }),
            msg => Ok(msg),
        }
    }

    /// Best effort: peers may already be gone.
    fn abort_peers(&mut self, err: &SimError) {
        let reason = err.to_string();
        if self.rank() == SOMA_OWNER {
            for worker in 1..self.comm.size() {
                let _ = self.comm.send(
                    worker,
                    Message::Abort {
                        reason: reason.clone(),
                    },
                );
            }
        } else if !matches!(err, SimError::PeerAborted { .. }) {
            let _ = self.comm.send(SOMA_OWNER, Message::Abort { reason });
        }
    }
}

fn unexpected(peer: usize, expected: &'static str, got: &Message) -> SimError {
    CommError::Unexpected {
        peer,
        expected,
        got: got.kind().to_string(),
    }
    .into()
}

/// Run a whole process group inside this process, one thread per rank.
///
/// Ranks share nothing but their message channels. Returns the soma owner's
/// report; if any rank fails, the first root-cause error is returned rather
/// than the disconnects it caused elsewhere.
pub fn simulate_local<O: SimObserver + Send>(
    cfg: SimConfig,
    processes: usize,
    observer: &mut O,
) -> Result<RunReport> {
    cfg.validate(processes)?;
    let endpoints = LocalGroup::new(processes);

    let results: Vec<Result<ProcessOutcome>> = thread::scope(|scope| {
        let mut observer = Some(observer);
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                let rank = endpoint.rank();
                let owner_observer = if rank == SOMA_OWNER {
                    observer.take()
                } else {
                    None
                };
                let handle = scope.spawn(move || -> Result<ProcessOutcome> {
                    let coordinator = Coordinator::new(cfg, endpoint)?;
                    match owner_observer {
                        Some(obs) => coordinator.run(obs),
                        None => coordinator.run(&mut NullObserver),
                    }
                });
                (rank, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .unwrap_or(Err(SimError::Panicked { rank }))
            })
            .collect()
    });

    let mut report = None;
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(outcome) => {
                if let Some(r) = outcome.into_report() {
                    report = Some(r);
                }
            }
            Err(err) => errors.push(err),
        }
    }

    if !errors.is_empty() {
        let root = errors
            .iter()
            .position(|e| !e.is_secondary())
            .unwrap_or(0);
        return Err(errors.swap_remove(root));
    }

    report.ok_or(SimError::Comm(CommError::Disconnected { peer: SOMA_OWNER }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OwnerPolicy, COMPTIME, STEPS, VREST};

    fn short(dendrites: usize, compartments: usize) -> SimConfig {
        SimConfig::with_size(dendrites, compartments).with_timing(10_000, 3)
    }

    #[test]
    fn single_process_samples_every_millisecond() {
        let cfg = short(2, 3);
        let report = simulate_local(cfg, 1, &mut NullObserver).unwrap();
        assert_eq!(report.series.len(), 3);
        assert_eq!(report.series.get(0), Some(cfg.initial_soma.v));
        assert_eq!(report.fine_steps, cfg.total_fine_steps());
        assert_eq!(report.processes, 1);
    }

    #[test]
    fn process_count_does_not_change_the_trace() {
        let cfg = short(5, 4);
        let one = simulate_local(cfg, 1, &mut NullObserver).unwrap();
        let three = simulate_local(cfg, 3, &mut NullObserver).unwrap();
        assert_eq!(one.series.len(), three.series.len());
        for ((_, a), (_, b)) in one.series.iter().zip(three.series.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn dedicated_owner_matches_shared_owner() {
        let cfg = short(3, 2);
        let shared = simulate_local(cfg, 2, &mut NullObserver).unwrap();
        let dedicated = simulate_local(
            cfg.with_owner_policy(OwnerPolicy::Dedicated),
            3,
            &mut NullObserver,
        )
        .unwrap();
        // Same association of the current sum, so the traces match exactly.
        assert_eq!(shared.series, dedicated.series);
    }

    #[test]
    fn dedicated_owner_rejects_single_process() {
        let cfg = short(3, 2).with_owner_policy(OwnerPolicy::Dedicated);
        let err = simulate_local(cfg, 1, &mut NullObserver).unwrap_err();
        assert!(matches!(err, SimError::Config(_)));
    }

    #[test]
    fn divergence_is_reported_and_aborts_workers() {
        let soma = SomaState {
            v: 1e306,
            ..SomaState::RESTING
        };
        let cfg = short(2, 1).with_initial_soma(soma);
        let err = simulate_local(cfg, 2, &mut NullObserver).unwrap_err();
        assert!(matches!(err, SimError::Divergence { step: 0, .. }), "{err}");
    }

    #[test]
    fn worker_rejects_mismatched_assignment() {
        let mut group = LocalGroup::new(2);
        let worker = group.pop().unwrap();
        let mut owner = group.pop().unwrap();

        let handle = thread::spawn(move || {
            Coordinator::new(short(4, 1), worker)
                .unwrap()
                .run(&mut NullObserver)
        });
        owner
            .send(1, Message::Assign { first: 0, count: 4 })
            .unwrap();
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            SimError::Comm(CommError::AssignmentMismatch {
                rank: 1,
                computed: (2, 2),
                granted: (0, 4),
            })
        ));
        // The worker told the owner why it stopped.
        assert!(matches!(owner.recv(1).unwrap(), Message::Abort { .. }));
    }

    #[test]
    fn worker_rejects_out_of_step_voltage() {
        let mut group = LocalGroup::new(2);
        let worker = group.pop().unwrap();
        let mut owner = group.pop().unwrap();

        let handle = thread::spawn(move || {
            Coordinator::new(short(2, 1), worker)
                .unwrap()
                .run(&mut NullObserver)
        });
        owner
            .send(1, Message::Assign { first: 1, count: 1 })
            .unwrap();
        assert!(matches!(
            owner.recv(1).unwrap(),
            Message::Current { step: 0, .. }
        ));
        owner
            .send(1, Message::SomaVoltage { step: 5, mv: -65.0 })
            .unwrap();
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            SimError::Comm(CommError::OutOfStep {
                expected: 1,
                got: 5,
                ..
            })
        ));
    }

    #[test]
    fn roles_follow_rank() {
        let mut group = LocalGroup::new(2);
        let worker = group.pop().unwrap();
        let owner = group.pop().unwrap();
        let cfg = short(3, 1);

        let owner = Coordinator::new(cfg, owner).unwrap();
        let worker = Coordinator::new(cfg, worker).unwrap();
        assert!(owner.is_soma_owner());
        assert!(!worker.is_soma_owner());
        assert_eq!(owner.owned_dendrites(), 0..2);
        assert_eq!(worker.owned_dendrites(), 2..3);
        assert_eq!(owner.phase(), Phase::Initializing);
        assert_eq!(worker.snapshot().owned_dendrites, 1);
    }

    #[test]
    fn single_dendrite_full_run() {
        let cfg = SimConfig::default();
        assert_eq!((cfg.dendrites, cfg.compartments), (1, 1));
        assert_eq!((cfg.steps_per_ms, cfg.duration_ms), (STEPS, COMPTIME));

        let report = simulate_local(cfg, 1, &mut NullObserver).unwrap();
        assert_eq!(report.series.len(), COMPTIME as usize);
        assert_eq!(report.series.get(0), Some(-65.0));
        assert_eq!(report.fine_steps, 99 * STEPS as u64);
        assert!(report.series.as_slice().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn three_dendrites_over_two_processes() {
        let cfg = SimConfig::with_size(3, 2).with_timing(STEPS, 5);
        let report = simulate_local(cfg, 2, &mut NullObserver).unwrap();
        assert_eq!(report.series.len(), 5);
        assert_eq!(report.processes, 2);
    }

    #[test]
    fn runs_are_reproducible() {
        let cfg = SimConfig::with_size(4, 3).with_timing(STEPS, 4);
        let first = simulate_local(cfg, 2, &mut NullObserver).unwrap();
        let second = simulate_local(cfg, 2, &mut NullObserver).unwrap();
        assert_eq!(first.series, second.series);
    }

    #[test]
    fn more_dendrites_drive_the_soma_harder() {
        let few = SimConfig::with_size(1, 2).with_timing(STEPS, 3);
        let many = SimConfig::with_size(8, 2).with_timing(STEPS, 3);
        let few = simulate_local(few, 1, &mut NullObserver).unwrap();
        let many = simulate_local(many, 3, &mut NullObserver).unwrap();
        let (Some(a), Some(b)) = (few.series.get(2), many.series.get(2)) else {
            panic!("missing sample");
        };
        assert!(b > a, "{b} should exceed {a}");
    }

    #[test]
    fn current_order_barely_moves_the_soma() {
        let dt = 1.0 / STEPS as f64;
        let currents: Vec<f64> = (0..6)
            .map(|d| {
                let mut chain = DendriteChain::new(3);
                (0..50u32)
                    .map(|step| chain.step(tip_seed(step, d), dt, VREST))
                    .last()
                    .unwrap()
            })
            .collect();

        let advance = |order: &[usize]| {
            let mut soma = SomaState::RESTING;
            let mut params = SomaParams::new(dt);
            params.i_dendritic = order.iter().map(|&i| currents[i]).sum();
            soma.advance(&params);
            soma.v
        };
        let forward = advance(&[0, 1, 2, 3, 4, 5]);
        for order in [[5, 4, 3, 2, 1, 0], [2, 0, 5, 1, 3, 4], [1, 3, 5, 0, 2, 4]] {
            assert!((advance(&order) - forward).abs() < 1e-12);
        }
    }

    #[test]
    fn invalid_topology_is_rejected_before_running() {
        let cfg = SimConfig::with_size(0, 1);
        assert!(simulate_local(cfg, 1, &mut NullObserver).is_err());
        let cfg = SimConfig::with_size(2, 1).with_owner_policy(OwnerPolicy::Dedicated);
        assert!(simulate_local(cfg, 1, &mut NullObserver).is_err());
    }
}
