//! Output collaborators: the per-run data file and the gnuplot renderer.

mod datafile;
mod plot;

pub use datafile::{run_stem, write_series, DataHeader, OutputPaths, PendingDataFile};
pub use plot::{plot_data, PlotInfo, PlotMode};

use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, warn};

use crate::results::RunReport;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("could not create directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not open {path:?}: {source}")]
    CreateFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not write {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not read data header: {0}")]
    BadHeader(String),

    #[error("could not start gnuplot: {0}")]
    PlotLaunch(std::io::Error),

    #[error("gnuplot exited with {0}")]
    PlotFailed(std::process::ExitStatus),
}

/// Write the finished run to its data file, then plot it if asked to.
///
/// Only a failure to write the data is returned; plotting problems are
/// logged and leave the result intact.
pub fn finish_run(
    pending: PendingDataFile,
    paths: &OutputPaths,
    report: &RunReport,
    mode: PlotMode,
) -> Result<PathBuf, OutputError> {
    let data = pending.finish(report)?;
    info!(path = %data.display(), samples = report.series.len(), "results written");

    let image = match mode {
        PlotMode::None => return Ok(data),
        PlotMode::Png => Some(paths.graph_file.as_path()),
        PlotMode::Screen => None,
    };
    let info = PlotInfo::from(&DataHeader::from_report(report));
    match plot_data(&info, &data, image) {
        Ok(()) => {
            if let Some(image) = image {
                info!(path = %image.display(), "plot written");
            }
        }
        Err(e) => warn!("plotting failed: {e}"),
    }
    Ok(data)
}
