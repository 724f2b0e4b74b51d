//! hhsimd - multi-process runner for the compartmental neuron simulator
//!
//! Every rank is its own OS process and the ranks talk over TCP:
//! - `hhsimd --launch N` spawns ranks 1..N as child processes and acts as
//!   rank 0 (soma owner, data file, plot);
//! - `hhsimd --rank R --size N --addr HOST:PORT` joins a group whose rank 0
//!   listens on HOST:PORT.
//!
//! Group formation runs on tokio; once every socket is connected the
//! fine-step loop runs on a blocking thread over plain sockets.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitCode, Stdio};
use std::sync::Arc;

use chrono::Local;
use tokio::net::TcpListener;
use tokio::process::{Child, Command as ChildCommand};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hhsim::cli::{self, exit, Command, CommonArgs, UsageError};
use hhsim::coordinator::Coordinator;
use hhsim::observer::{NullObserver, ProgressObserver};
use hhsim::output::{finish_run, run_stem, OutputPaths};

mod bootstrap;
mod codec;
mod error;
mod group;

use bootstrap::BOOTSTRAP_TIMEOUT;
use error::DaemonError;

const DEFAULT_ADDR: &str = "127.0.0.1:9877";

/// The partial data file rank 0 is writing, if any.
type PartialSlot = Arc<Mutex<Option<PathBuf>>>;

const EXTRA_OPTIONS: &str = "      --launch N             Start N ranks: this process is rank 0 and
                             spawns ranks 1..N (default 1).
      --rank R --size N      Join a group of N ranks as rank R.
      --addr HOST:PORT       Rank 0's address (default 127.0.0.1:9877).
";

// ═══════════════════════════════════════════════════════════════════════════
// Arguments
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Rank 0; spawn the workers ourselves when `spawn` is set.
    Owner { size: usize, spawn: bool },
    Worker { rank: usize, size: usize },
}

struct DaemonArgs {
    common: CommonArgs,
    role: Role,
    addr: SocketAddr,
}

fn parse_args() -> Result<Command<DaemonArgs>, UsageError> {
    let mut launch = None;
    let mut rank = None;
    let mut size = None;
    let mut addr = DEFAULT_ADDR.to_string();

    let parsed = cli::parse_with(std::env::args().skip(1), |flag, args| {
        match flag {
            "--launch" => launch = Some(args.count(flag)?),
            "--size" => size = Some(args.count(flag)?),
            "--addr" => addr = args.value(flag)?,
            "--rank" => {
                let value = args.value(flag)?;
                rank = Some(value.parse::<usize>().map_err(|_| UsageError::InvalidValue {
                    flag: flag.to_string(),
                    reason: format!("'{value}' is not a rank"),
                })?);
            }
            _ => return Ok(false),
        }
        Ok(true)
    })?;

    let common = match parsed {
        Command::Help => return Ok(Command::Help),
        Command::Run(common) => common,
    };

    let addr: SocketAddr = addr.parse().map_err(|_| UsageError::InvalidValue {
        flag: "--addr".to_string(),
        reason: format!("'{addr}' is not HOST:PORT"),
    })?;

    let role = match (launch, rank, size) {
        (Some(size), None, None) => Role::Owner { size, spawn: true },
        (None, None, None) => Role::Owner {
            size: 1,
            spawn: true,
        },
        (None, Some(0), Some(size)) => Role::Owner { size, spawn: false },
        (None, Some(rank), Some(size)) if rank < size => Role::Worker { rank, size },
        (None, Some(rank), Some(size)) => {
            return Err(UsageError::InvalidValue {
                flag: "--rank".to_string(),
                reason: format!("rank {rank} is outside a group of {size}"),
            })
        }
        (None, Some(_), None) | (None, None, Some(_)) => {
            return Err(UsageError::InvalidValue {
                flag: "--rank".to_string(),
                reason: "--rank and --size go together".to_string(),
            })
        }
        (Some(_), _, _) => {
            return Err(UsageError::InvalidValue {
                flag: "--launch".to_string(),
                reason: "cannot be combined with --rank/--size".to_string(),
            })
        }
    };

    Ok(Command::Run(DaemonArgs { common, role, addr }))
}

// ═══════════════════════════════════════════════════════════════════════════
// Rank 0
// ═══════════════════════════════════════════════════════════════════════════

fn spawn_workers(size: usize, addr: SocketAddr) -> Result<Vec<Child>, DaemonError> {
    let exe = std::env::current_exe()?;
    (1..size)
        .map(|rank| {
            ChildCommand::new(&exe)
                .arg("--rank")
                .arg(rank.to_string())
                .arg("--size")
                .arg(size.to_string())
                .arg("--addr")
                .arg(addr.to_string())
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(DaemonError::from)
        })
        .collect()
}

async fn run_owner(
    args: DaemonArgs,
    size: usize,
    spawn: bool,
    partial: PartialSlot,
) -> Result<(), DaemonError> {
    let cfg = args.common.build_config()?;
    cfg.validate(size)?;

    let stem = run_stem(size, cfg.dendrites, cfg.compartments, Local::now());
    let paths = OutputPaths::new(&args.common.out_dir, &stem);
    let pending = paths.prepare(args.common.plot.wants_image())?;
    *partial.lock().await = Some(pending.partial_path().to_path_buf());

    let result = async {
        let listener = TcpListener::bind(args.addr).await?;
        let addr = listener.local_addr()?;
        info!(%addr, size, "rank 0 listening");

        let children = if spawn {
            spawn_workers(size, addr)?
        } else {
            Vec::new()
        };

        let group = bootstrap::host(listener, size, &cfg, BOOTSTRAP_TIMEOUT).await?;
        let outcome = tokio::task::spawn_blocking(move || {
            let mut progress = ProgressObserver::new(io::stderr());
            Coordinator::new(cfg, group)?.run(&mut progress)
        })
        .await??;

        for mut child in children {
            match child.wait().await {
                Ok(status) if !status.success() => warn!("worker exited with {status}"),
                Ok(_) => {}
                Err(e) => warn!("could not reap worker: {e}"),
            }
        }
        Ok::<_, DaemonError>(outcome)
    }
    .await;

    let report = match result {
        Ok(outcome) => outcome.into_report(),
        Err(e) => {
            partial.lock().await.take();
            if let Err(io) = pending.discard() {
                error!("could not remove incomplete data file: {io}");
            }
            return Err(e);
        }
    };
    let Some(report) = report else {
        return Err(DaemonError::Bootstrap(
            "rank 0 finished without a report".to_string(),
        ));
    };

    info!(
        exec_secs = report.exec_time.as_secs_f64(),
        fine_steps = report.fine_steps,
        "simulation complete"
    );
    partial.lock().await.take();
    finish_run(pending, &paths, &report, args.common.plot)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Workers
// ═══════════════════════════════════════════════════════════════════════════

async fn run_worker(addr: SocketAddr, rank: usize, size: usize) -> Result<(), DaemonError> {
    let (cfg, group) = bootstrap::join(addr, rank, size, BOOTSTRAP_TIMEOUT).await?;
    let outcome = tokio::task::spawn_blocking(move || {
        Coordinator::new(cfg, group)?.run(&mut NullObserver)
    })
    .await??;
    info!(rank, ?outcome, "worker finished");
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

/// Exit with the interrupt status on Ctrl-C. Exiting closes every socket,
/// which aborts the rest of the group; rank 0 first removes its partial file.
async fn exit_on_interrupt(partial: PartialSlot) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    warn!("interrupted");
    if let Some(path) = partial.lock().await.take() {
        remove_partial(&path);
    }
    std::process::exit(i32::from(exit::INTERRUPTED));
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "removed partial data file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => error!(path = %path.display(), "could not remove partial data file: {e}"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let args = match parse_args() {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            print!(
                "{}",
                cli::usage(
                    "hhsimd",
                    "[--launch N | --rank R --size N] [--addr HOST:PORT]",
                    EXTRA_OPTIONS
                )
            );
            return ExitCode::from(exit::OK);
        }
        Err(e) => {
            eprintln!("hhsimd: {e}");
            eprintln!("Try 'hhsimd --help'.");
            return ExitCode::from(exit::USAGE);
        }
    };

    let partial = PartialSlot::default();
    tokio::spawn(exit_on_interrupt(Arc::clone(&partial)));

    let result = match args.role {
        Role::Owner { size, spawn } => run_owner(args, size, spawn, partial).await,
        Role::Worker { rank, size } => run_worker(args.addr, rank, size).await,
    };

    match result {
        Ok(()) => ExitCode::from(exit::OK),
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn interrupt_cleanup_removes_the_registered_partial_file() {
        let path = std::env::temp_dir().join(format!("hhsimd-{}.dat.tmp", std::process::id()));
        fs::write(&path, b"").unwrap();

        let partial = PartialSlot::default();
        *partial.lock().await = Some(path.clone());
        if let Some(registered) = partial.lock().await.take() {
            remove_partial(&registered);
        }
        assert!(!path.exists());
        assert!(partial.lock().await.is_none());

        // Already gone, e.g. renamed by a finished run.
        remove_partial(&path);
    }
}
