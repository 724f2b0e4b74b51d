//! `hhsim`: run the whole process group inside one OS process.
//!
//! Each rank gets its own thread and talks to the others only through
//! messages, so the numbers match a multi-process `hhsimd` run.

use std::io;
use std::process::ExitCode;

use chrono::Local;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hhsim::cli::{self, exit, Command};
use hhsim::coordinator::simulate_local;
use hhsim::error::SimError;
use hhsim::observer::ProgressObserver;
use hhsim::output::{finish_run, run_stem, OutputPaths};

const EXTRA_OPTIONS: &str = "  -p, --processes N          Ranks in the in-process group (default 1).
";

fn main() -> ExitCode {
    init_tracing();

    let mut processes = 1usize;
    let parsed = cli::parse_with(std::env::args().skip(1), |flag, args| match flag {
        "-p" | "--processes" => {
            processes = args.count(flag)?;
            Ok(true)
        }
        _ => Ok(false),
    });

    let common = match parsed {
        Ok(Command::Run(common)) => common,
        Ok(Command::Help) => {
            print!("{}", cli::usage("hhsim", "[-p N]", EXTRA_OPTIONS));
            return ExitCode::from(exit::OK);
        }
        Err(e) => {
            eprintln!("hhsim: {e}");
            eprintln!("Try 'hhsim --help'.");
            return ExitCode::from(exit::USAGE);
        }
    };

    let cfg = match common.build_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(exit::USAGE);
        }
    };
    if let Err(e) = cfg.validate(processes) {
        error!("{e}");
        return ExitCode::from(exit::USAGE);
    }

    info!(
        dendrites = cfg.dendrites,
        compartments = cfg.compartments,
        processes,
        dt = cfg.dt(),
        duration_ms = cfg.duration_ms,
        policy = ?cfg.owner_policy,
        "starting simulation"
    );

    let stem = run_stem(processes, cfg.dendrites, cfg.compartments, Local::now());
    let paths = OutputPaths::new(&common.out_dir, &stem);
    let pending = match paths.prepare(common.plot.wants_image()) {
        Ok(pending) => pending,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(exit::FAILURE);
        }
    };

    let mut progress = ProgressObserver::new(io::stderr());
    let report = match simulate_local(cfg, processes, &mut progress) {
        Ok(report) => report,
        Err(e) => {
            error!("{e}");
            if let Err(io) = pending.discard() {
                error!("could not remove incomplete data file: {io}");
            }
            return ExitCode::from(match e {
                SimError::Config(_) => exit::USAGE,
                _ => exit::FAILURE,
            });
        }
    };

    info!(
        exec_secs = report.exec_time.as_secs_f64(),
        fine_steps = report.fine_steps,
        "simulation complete"
    );

    match finish_run(pending, &paths, &report, common.plot) {
        Ok(_) => ExitCode::from(exit::OK),
        Err(e) => {
            error!("{e}");
            ExitCode::from(exit::FAILURE)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}
