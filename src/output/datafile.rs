use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::warn;

use super::OutputError;
use crate::results::RunReport;

const HEADER_PREFIX: &str = "# Vm for HH model. ";

/// `pWWdXXcYY_MMDDYY_HHMMSS`: process count, dendrites, compartments and the
/// local time the run started.
pub fn run_stem(
    processes: usize,
    dendrites: usize,
    compartments: usize,
    started: DateTime<Local>,
) -> String {
    format!(
        "p{processes}d{dendrites}c{compartments}_{}",
        started.format("%m%d%y_%H%M%S")
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputPaths {
    pub data_dir: PathBuf,
    pub graph_dir: PathBuf,
    pub data_file: PathBuf,
    /// Written during the run and renamed to `data_file` once complete.
    pub partial_file: PathBuf,
    pub graph_file: PathBuf,
}

impl OutputPaths {
    pub fn new(root: &Path, stem: &str) -> Self {
        let data_dir = root.join("data");
        let graph_dir = root.join("graphs");
        Self {
            data_file: data_dir.join(format!("{stem}.dat")),
            partial_file: data_dir.join(format!("{stem}.dat.tmp")),
            graph_file: graph_dir.join(format!("{stem}.png")),
            data_dir,
            graph_dir,
        }
    }

    /// Create the output directories and open the partial data file.
    ///
    /// Called before any simulation work so a resource problem aborts the run
    /// up front. The data file itself only appears once the run finished.
    pub fn prepare(&self, with_graph: bool) -> Result<PendingDataFile, OutputError> {
        create_dir(&self.data_dir)?;
        if with_graph {
            create_dir(&self.graph_dir)?;
        }
        let file = File::create(&self.partial_file).map_err(|source| OutputError::CreateFile {
            path: self.partial_file.clone(),
            source,
        })?;
        Ok(PendingDataFile {
            partial: self.partial_file.clone(),
            path: self.data_file.clone(),
            out: BufWriter::new(file),
            settled: false,
        })
    }
}

fn create_dir(path: &Path) -> Result<(), OutputError> {
    fs::create_dir_all(path).map_err(|source| OutputError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

/// An opened, still empty partial file waiting for the run to finish.
///
/// Dropping it without [`finish`](Self::finish) removes the partial file.
pub struct PendingDataFile {
    partial: PathBuf,
    path: PathBuf,
    out: BufWriter<File>,
    settled: bool,
}

impl PendingDataFile {
    pub fn partial_path(&self) -> &Path {
        &self.partial
    }

    /// Write the series and move it to the data file path.
    pub fn finish(mut self, report: &RunReport) -> Result<PathBuf, OutputError> {
        write_series(&mut self.out, report)
            .and_then(|_| self.out.flush())
            .and_then(|_| fs::rename(&self.partial, &self.path))
            .map_err(|source| OutputError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.settled = true;
        Ok(self.path.clone())
    }

    /// Remove the partial file when the run failed.
    pub fn discard(mut self) -> io::Result<()> {
        self.settled = true;
        fs::remove_file(&self.partial)
    }
}

impl Drop for PendingDataFile {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Err(e) = fs::remove_file(&self.partial) {
            warn!(path = %self.partial.display(), "could not remove partial data file: {e}");
        }
    }
}

/// Run metadata recorded in the first line of a data file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataHeader {
    pub duration_ms: u32,
    /// Integration step, ms.
    pub dt: f64,
    pub compartments: usize,
    pub dendrites: usize,
    pub exec_secs: f64,
    pub processes: usize,
}

impl DataHeader {
    pub fn from_report(report: &RunReport) -> Self {
        Self {
            duration_ms: report.config.duration_ms,
            dt: report.config.dt(),
            compartments: report.config.compartments,
            dendrites: report.config.dendrites,
            exec_secs: report.exec_time.as_secs_f64(),
            processes: report.processes,
        }
    }

    pub fn parse(line: &str) -> Result<Self, OutputError> {
        let bad = |why: &str| OutputError::BadHeader(format!("{why}: {line:?}"));
        let rest = line
            .trim_end()
            .strip_prefix(HEADER_PREFIX)
            .ok_or_else(|| bad("missing header prefix"))?;

        let mut duration_ms = None;
        let mut dt = None;
        let mut compartments = None;
        let mut dendrites = None;
        let mut exec_secs = None;
        let mut processes = None;

        for field in rest.split(", ") {
            let (key, value) = field.split_once(": ").ok_or_else(|| bad("malformed field"))?;
            let number = value.split_whitespace().next().unwrap_or("");
            match key {
                "Simulation time" => duration_ms = number.parse().ok(),
                "Integration step" => dt = number.parse().ok(),
                "Compartments" => compartments = number.parse().ok(),
                "Dendrites" => dendrites = number.parse().ok(),
                "Execution time" => exec_secs = number.parse().ok(),
                "Processes" => processes = number.parse().ok(),
                _ => return Err(bad("unknown field")),
            }
        }

        Ok(Self {
            duration_ms: duration_ms.ok_or_else(|| bad("simulation time"))?,
            dt: dt.ok_or_else(|| bad("integration step"))?,
            compartments: compartments.ok_or_else(|| bad("compartments"))?,
            dendrites: dendrites.ok_or_else(|| bad("dendrites"))?,
            exec_secs: exec_secs.ok_or_else(|| bad("execution time"))?,
            processes: processes.ok_or_else(|| bad("processes"))?,
        })
    }
}

impl fmt::Display for DataHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{HEADER_PREFIX}Simulation time: {} ms, Integration step: {:.6} ms, \
             Compartments: {}, Dendrites: {}, Execution time: {:.6} s, Processes: {}",
            self.duration_ms,
            self.dt,
            self.compartments,
            self.dendrites,
            self.exec_secs,
            self.processes
        )
    }
}

/// Header, column line and one `<ms> <mV>` row per sample.
pub fn write_series<W: Write>(w: &mut W, report: &RunReport) -> io::Result<()> {
    writeln!(w, "{}", DataHeader::from_report(report))?;
    writeln!(w, "# X Y")?;
    for (ms, v) in report.series.iter() {
        writeln!(w, "{ms} {v:.6}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SimConfig, STEPS};
    use crate::coordinator::simulate_local;
    use crate::observer::NullObserver;
    use crate::results::ResultSeries;
    use chrono::TimeZone;
    use std::time::Duration;

    fn report() -> RunReport {
        let mut series = ResultSeries::new(3);
        series.push(-65.0);
        series.push(-64.25);
        series.push(12.5);
        RunReport {
            config: SimConfig::with_size(4, 2).with_timing(10_000, 3),
            processes: 2,
            series,
            exec_time: Duration::from_millis(1500),
            fine_steps: 20_000,
        }
    }

    #[test]
    fn stem_encodes_topology_and_time() {
        let t = Local.with_ymd_and_hms(2018, 3, 7, 14, 5, 9).unwrap();
        assert_eq!(run_stem(3, 10, 5, t), "p3d10c5_030718_140509");
    }

    #[test]
    fn series_format() {
        let mut buf = Vec::new();
        write_series(&mut buf, &report()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "# Vm for HH model. Simulation time: 3 ms, Integration step: 0.000100 ms, \
             Compartments: 2, Dendrites: 4, Execution time: 1.500000 s, Processes: 2"
        );
        assert_eq!(lines[1], "# X Y");
        assert_eq!(&lines[2..], &["0 -65.000000", "1 -64.250000", "2 12.500000"]);
    }

    #[test]
    fn header_parses_back() {
        let header = DataHeader::from_report(&report());
        let parsed = DataHeader::parse(&header.to_string()).unwrap();
        assert_eq!(parsed.duration_ms, 3);
        assert_eq!(parsed.compartments, 2);
        assert_eq!(parsed.dendrites, 4);
        assert_eq!(parsed.processes, 2);
        assert!((parsed.dt - 1e-4).abs() < 1e-9);
        assert!((parsed.exec_secs - 1.5).abs() < 1e-9);

        assert!(DataHeader::parse("# X Y").is_err());
    }

    #[test]
    fn prepare_creates_directories_and_finish_writes() {
        let root = tempfile::tempdir().unwrap();
        let paths = OutputPaths::new(root.path(), "p2d4c2_000000_000000");
        let pending = paths.prepare(true).unwrap();
        assert!(paths.data_dir.is_dir());
        assert!(paths.graph_dir.is_dir());
        assert!(paths.partial_file.is_file());
        assert!(!paths.data_file.exists());

        let written = pending.finish(&report()).unwrap();
        assert_eq!(written, paths.data_file);
        assert!(!paths.partial_file.exists());
        let text = fs::read_to_string(&written).unwrap();
        assert_eq!(text.lines().count(), 5);
    }

    #[test]
    fn discard_removes_the_empty_file() {
        let root = tempfile::tempdir().unwrap();
        let paths = OutputPaths::new(root.path(), "stem");
        let pending = paths.prepare(false).unwrap();
        assert!(!paths.graph_dir.exists());
        pending.discard().unwrap();
        assert!(!paths.partial_file.exists());
        assert!(!paths.data_file.exists());
    }

    #[test]
    fn abandoned_file_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let paths = OutputPaths::new(root.path(), "stem");
        let pending = paths.prepare(false).unwrap();
        assert_eq!(pending.partial_path(), paths.partial_file.as_path());
        drop(pending);
        assert_eq!(fs::read_dir(&paths.data_dir).unwrap().count(), 0);
    }

    #[test]
    fn failed_finish_leaves_no_data_file() {
        let root = tempfile::tempdir().unwrap();
        let paths = OutputPaths::new(root.path(), "stem");
        let pending = paths.prepare(false).unwrap();
        // A directory in the way makes the final rename fail.
        fs::create_dir(&paths.data_file).unwrap();

        let err = pending.finish(&report()).unwrap_err();
        assert!(matches!(err, OutputError::Write { .. }), "{err}");
        assert!(!paths.partial_file.exists());
        assert!(paths.data_file.is_dir());
    }

    #[test]
    fn report_lands_in_a_parseable_data_file() {
        let root = tempfile::tempdir().unwrap();
        let cfg = SimConfig::with_size(2, 1).with_timing(STEPS, 3);
        let paths = OutputPaths::new(root.path(), "p1d2c1_test");
        let pending = paths.prepare(false).unwrap();

        let report = simulate_local(cfg, 1, &mut NullObserver).unwrap();
        let written = pending.finish(&report).unwrap();
        assert_eq!(written, root.path().join("data").join("p1d2c1_test.dat"));

        let text = fs::read_to_string(&written).unwrap();
        let mut lines = text.lines();
        let header = DataHeader::parse(lines.next().unwrap()).unwrap();
        assert_eq!(header.duration_ms, 3);
        assert_eq!(header.dendrites, 2);
        assert_eq!(header.compartments, 1);
        assert_eq!(header.processes, 1);
        assert_eq!(lines.next(), Some("# X Y"));
        assert_eq!(lines.next(), Some("0 -65.000000"));
        assert_eq!(lines.count(), 2);
    }

    #[test]
    fn unwritable_root_is_a_resource_error() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("data");
        fs::write(&blocker, b"not a directory").unwrap();
        let paths = OutputPaths::new(root.path(), "stem");
        assert!(matches!(
            paths.prepare(false),
            Err(OutputError::CreateDir { .. })
        ));
    }
}
