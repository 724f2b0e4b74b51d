use std::fmt::Write as _;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::str::FromStr;

use tracing::debug;

use super::{DataHeader, OutputError};

const GNUPLOT: &str = "gnuplot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlotMode {
    #[default]
    None,
    /// Render `<out>/graphs/<stem>.png`.
    Png,
    /// Interactive gnuplot window.
    Screen,
}

impl PlotMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Some(Self::None),
            "png" => Some(Self::Png),
            "screen" | "x11" => Some(Self::Screen),
            _ => None,
        }
    }

    pub fn wants_image(self) -> bool {
        self == Self::Png
    }
}

impl FromStr for PlotMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown plot mode '{s}' (png, screen, none)"))
    }
}

/// Figures printed in the plot title.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotInfo {
    pub sim_time: u32,
    pub int_step: f64,
    pub compartments: usize,
    pub dendrites: usize,
    pub exec_time: f64,
    pub processes: usize,
}

impl From<&DataHeader> for PlotInfo {
    fn from(h: &DataHeader) -> Self {
        Self {
            sim_time: h.duration_ms,
            int_step: h.dt,
            compartments: h.compartments,
            dendrites: h.dendrites,
            exec_time: h.exec_secs,
            processes: h.processes,
        }
    }
}

fn script(info: &PlotInfo, data: &Path, image: Option<&Path>) -> String {
    let mut s = String::new();
    if let Some(image) = image {
        let _ = writeln!(s, "set terminal png");
        let _ = writeln!(s, "set output '{}'", image.display());
    }
    let _ = writeln!(
        s,
        "set title \"Membrane Potential\\nSimulation time: {} ms, Integration step: {:.6} ms,\\n\
         Compartments: {}, Dendrites: {}, Execution time: {:.6} s,\\nProcesses: {}\"",
        info.sim_time,
        info.int_step,
        info.compartments,
        info.dendrites,
        info.exec_time,
        info.processes
    );
    let _ = writeln!(s, "set xlabel 'Time, ms'");
    let _ = writeln!(s, "set ylabel 'Vm, mV'");
    let _ = writeln!(s, "unset key");
    let _ = writeln!(s, "plot '{}' using 1:2 with lines", data.display());
    s
}

/// Plot the `<ms> <mV>` columns of `data` with gnuplot.
///
/// With `image` the plot goes to a PNG file, otherwise to a persistent
/// window. Blocks until gnuplot has read the script.
pub fn plot_data(info: &PlotInfo, data: &Path, image: Option<&Path>) -> Result<(), OutputError> {
    pipe_script(GNUPLOT, &script(info, data, image))
}

fn pipe_script(program: &str, script: &str) -> Result<(), OutputError> {
    debug!(program, "starting plotter");
    let mut child = Command::new(program)
        .arg("-persist")
        .stdin(Stdio::piped())
        .spawn()
        .map_err(OutputError::PlotLaunch)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.as_bytes())
            .map_err(OutputError::PlotLaunch)?;
        // Closing stdin lets gnuplot exit (or detach its window).
    }

    let status = child.wait().map_err(OutputError::PlotLaunch)?;
    if status.success() {
        Ok(())
    } else {
        Err(OutputError::PlotFailed(status))
    }
}
