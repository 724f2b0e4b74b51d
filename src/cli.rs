//! Command-line flags shared by the `hhsim` and `hhsimd` runners.
//!
//! Parsing is hand-rolled over `std::env::args`: a handful of flags does not
//! warrant an argument-parsing framework.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::{OwnerPolicy, SimConfig};
use crate::output::PlotMode;

/// Exit codes used by both runners.
pub mod exit {
    pub const OK: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const USAGE: u8 = 2;
    pub const INTERRUPTED: u8 = 130;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UsageError {
    #[error("{0} requires a value")]
    MissingValue(String),

    #[error("{flag} must be a whole number greater than 0, got '{value}'")]
    InvalidCount { flag: String, value: String },

    #[error("invalid value for {flag}: {reason}")]
    InvalidValue { flag: String, reason: String },

    #[error("unknown option '{0}'")]
    Unknown(String),

    #[error("could not load config {path:?}: {reason}")]
    ConfigFile { path: PathBuf, reason: String },
}

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum Command<T> {
    Run(T),
    Help,
}

/// Walks the arguments after the program name.
pub struct ArgCursor {
    args: std::vec::IntoIter<String>,
}

impl ArgCursor {
    pub fn new<I: IntoIterator<Item = String>>(args: I) -> Self {
        Self {
            args: args.into_iter().collect::<Vec<_>>().into_iter(),
        }
    }

    fn next_flag(&mut self) -> Option<String> {
        self.args.next()
    }

    /// The value following `flag`.
    pub fn value(&mut self, flag: &str) -> Result<String, UsageError> {
        self.args
            .next()
            .ok_or_else(|| UsageError::MissingValue(flag.to_string()))
    }

    /// A strictly positive count following `flag`.
    pub fn count(&mut self, flag: &str) -> Result<usize, UsageError> {
        let value = self.value(flag)?;
        match value.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(UsageError::InvalidCount {
                flag: flag.to_string(),
                value,
            }),
        }
    }
}

/// Flags understood by every runner.
#[derive(Debug, Clone, PartialEq)]
pub struct CommonArgs {
    pub dendrites: Option<usize>,
    pub compartments: Option<usize>,
    pub config_file: Option<PathBuf>,
    pub out_dir: PathBuf,
    pub plot: PlotMode,
    pub dedicated_owner: bool,
}

impl Default for CommonArgs {
    fn default() -> Self {
        Self {
            dendrites: None,
            compartments: None,
            config_file: None,
            out_dir: PathBuf::from("."),
            plot: PlotMode::None,
            dedicated_owner: false,
        }
    }
}

impl CommonArgs {
    /// Consume `flag` if it is a shared one. `Ok(false)` leaves it to the caller.
    fn accept(&mut self, flag: &str, args: &mut ArgCursor) -> Result<bool, UsageError> {
        match flag {
            "-d" | "--dendrites" => self.dendrites = Some(args.count(flag)?),
            "-c" | "--compartments" => self.compartments = Some(args.count(flag)?),
            "--config" => self.config_file = Some(PathBuf::from(args.value(flag)?)),
            "--out" => self.out_dir = PathBuf::from(args.value(flag)?),
            "--plot" => {
                let value = args.value(flag)?;
                self.plot = value.parse().map_err(|reason| UsageError::InvalidValue {
                    flag: flag.to_string(),
                    reason,
                })?;
            }
            "--dedicated-owner" => self.dedicated_owner = true,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// The run configuration: the config file (or defaults) with explicit
    /// flags applied on top.
    pub fn build_config(&self) -> Result<SimConfig, UsageError> {
        let mut cfg = match &self.config_file {
            Some(path) => load_config(path)?,
            None => SimConfig::default(),
        };
        if let Some(d) = self.dendrites {
            cfg.dendrites = d;
        }
        if let Some(c) = self.compartments {
            cfg.compartments = c;
        }
        if self.dedicated_owner {
            cfg.owner_policy = OwnerPolicy::Dedicated;
        }
        Ok(cfg)
    }
}

#[cfg(feature = "serde")]
fn load_config(path: &std::path::Path) -> Result<SimConfig, UsageError> {
    let fail = |reason: String| UsageError::ConfigFile {
        path: path.to_path_buf(),
        reason,
    };
    let text = std::fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| fail(e.to_string()))
}

#[cfg(not(feature = "serde"))]
fn load_config(path: &std::path::Path) -> Result<SimConfig, UsageError> {
    Err(UsageError::ConfigFile {
        path: path.to_path_buf(),
        reason: "built without the `serde` feature".to_string(),
    })
}

/// Parse `args` (program name excluded).
///
/// `-h`/`--help` anywhere wins over everything else. Flags the shared set
/// does not know are offered to `extra`, which returns `Ok(false)` to reject
/// them.
pub fn parse_with<I, F>(args: I, mut extra: F) -> Result<Command<CommonArgs>, UsageError>
where
    I: IntoIterator<Item = String>,
    F: FnMut(&str, &mut ArgCursor) -> Result<bool, UsageError>,
{
    let args: Vec<String> = args.into_iter().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        return Ok(Command::Help);
    }

    let mut cursor = ArgCursor::new(args);
    let mut common = CommonArgs::default();
    while let Some(flag) = cursor.next_flag() {
        if common.accept(&flag, &mut cursor)? {
            continue;
        }
        if !extra(&flag, &mut cursor)? {
            return Err(UsageError::Unknown(flag));
        }
    }
    Ok(Command::Run(common))
}

/// Usage text for `program`; `extra_options` is appended to the shared list.
pub fn usage(program: &str, synopsis: &str, extra_options: &str) -> String {
    format!(
        "USAGE:
  {program} [-h] [-d NUM_DENDR] [-c NUM_COMPARTMENTS] {synopsis}

  Simulates a neuron using a simplified Hodgkin-Huxley compartmental model:
  one active soma fed by passive dendrites, integrated with 4th order
  Runge-Kutta and split over a group of processes.

  The somatic voltage is sampled once per simulated millisecond and written
  to OUT/data/pWWdXXcYY_MMDDYY_HHMMSS.dat, where WW is the number of
  processes, XX the number of dendrites and YY the number of compartments.

OPTIONS:
  -h, --help                 Print this usage statement and exit.
  -d, --dendrites N          Dendrites to simulate (> 0, default 1).
  -c, --compartments N       Compartments per dendrite (> 0, default 1).
      --config FILE          JSON run configuration; -d/-c override it.
      --out DIR              Output root (default: current directory).
      --plot MODE            png, screen or none (default none). PNG images
                             go to OUT/graphs/ under the data file's name.
      --dedicated-owner      Rank 0 advances only the soma.
{extra_options}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    fn parse(s: &str) -> Result<Command<CommonArgs>, UsageError> {
        parse_with(args(s), |_, _| Ok(false))
    }

    #[test]
    fn defaults_without_flags() {
        let Command::Run(common) = parse("").unwrap() else {
            panic!("expected run");
        };
        assert_eq!(common, CommonArgs::default());
        assert_eq!(common.build_config().unwrap(), SimConfig::default());
    }

    #[test]
    fn shared_flags_override_defaults() {
        let Command::Run(common) = parse("-d 3 --compartments 5 --plot png --out /tmp/x").unwrap()
        else {
            panic!("expected run");
        };
        let cfg = common.build_config().unwrap();
        assert_eq!(cfg.dendrites, 3);
        assert_eq!(cfg.compartments, 5);
        assert_eq!(common.plot, PlotMode::Png);
        assert_eq!(common.out_dir, PathBuf::from("/tmp/x"));
        assert_eq!(cfg.owner_policy, OwnerPolicy::SharesDendrites);
    }

    #[test]
    fn help_anywhere_wins() {
        assert_eq!(parse("-d 0 --bogus -h").unwrap(), Command::Help);
        assert_eq!(parse("--help").unwrap(), Command::Help);
    }

    #[test]
    fn non_positive_counts_are_usage_errors() {
        for bad in ["-d 0", "-d -1", "-c abc", "-c 1.5"] {
            assert!(
                matches!(parse(bad), Err(UsageError::InvalidCount { .. })),
                "{bad}"
            );
        }
        assert_eq!(
            parse("-d"),
            Err(UsageError::MissingValue("-d".to_string()))
        );
    }

    #[test]
    fn unknown_flags_are_rejected_unless_claimed() {
        assert_eq!(parse("-x"), Err(UsageError::Unknown("-x".to_string())));
        assert!(matches!(
            parse("--plot svg"),
            Err(UsageError::InvalidValue { .. })
        ));

        let mut processes = 1;
        let parsed = parse_with(args("-p 4 --dedicated-owner"), |flag, cursor| {
            if flag == "-p" {
                processes = cursor.count(flag)?;
                return Ok(true);
            }
            Ok(false)
        })
        .unwrap();
        assert_eq!(processes, 4);
        let Command::Run(common) = parsed else {
            panic!("expected run");
        };
        assert_eq!(
            common.build_config().unwrap().owner_policy,
            OwnerPolicy::Dedicated
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_file_is_the_base_and_flags_win() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{ "dendrites": 7, "compartments": 2, "duration_ms": 20 }"#,
        )
        .unwrap();

        let line = format!("--config {} -c 4", path.display());
        let Command::Run(common) = parse(&line).unwrap() else {
            panic!("expected run");
        };
        let cfg = common.build_config().unwrap();
        assert_eq!(cfg.dendrites, 7);
        assert_eq!(cfg.compartments, 4);
        assert_eq!(cfg.duration_ms, 20);
        assert_eq!(cfg.steps_per_ms, crate::config::STEPS);
    }

    #[test]
    fn unreadable_config_file_is_reported() {
        let common = CommonArgs {
            config_file: Some(PathBuf::from("/nonexistent/hhsim/run.json")),
            ..CommonArgs::default()
        };
        assert!(matches!(
            common.build_config(),
            Err(UsageError::ConfigFile { .. })
        ));
    }

    #[test]
    fn usage_mentions_extra_options() {
        let text = usage("hhsim", "[-p N]", "  -p, --processes N\n");
        assert!(text.starts_with("USAGE:\n  hhsim [-h]"));
        assert!(text.contains("--dedicated-owner"));
        assert!(text.ends_with("  -p, --processes N\n"));
    }
}
