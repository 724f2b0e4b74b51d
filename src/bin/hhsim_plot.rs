//! `hhsim-plot DATA [IMAGE]`: plot a data file written by `hhsim`/`hhsimd`.
//!
//! The title figures come from the file's own header line. Without IMAGE
//! the plot opens in a gnuplot window.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use hhsim::cli::exit;
use hhsim::output::{plot_data, DataHeader, OutputError, PlotInfo};

fn usage() {
    eprintln!("Usage: hhsim-plot DATA [IMAGE]");
    eprintln!("  DATA   data file written by hhsim or hhsimd");
    eprintln!("  IMAGE  write a PNG here instead of opening a window");
}

fn read_header(path: &Path) -> Result<DataHeader, OutputError> {
    let file = File::open(path).map_err(|source| OutputError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut first = String::new();
    BufReader::new(file)
        .read_line(&mut first)
        .map_err(|source| OutputError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    DataHeader::parse(&first)
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        usage();
        return ExitCode::from(exit::OK);
    }
    let (data, image) = match args.as_slice() {
        [data] => (PathBuf::from(data), None),
        [data, image] => (PathBuf::from(data), Some(PathBuf::from(image))),
        _ => {
            usage();
            return ExitCode::from(exit::USAGE);
        }
    };

    let result = read_header(&data)
        .and_then(|header| plot_data(&PlotInfo::from(&header), &data, image.as_deref()));
    match result {
        Ok(()) => ExitCode::from(exit::OK),
        Err(e) => {
            eprintln!("hhsim-plot: {e}");
            ExitCode::from(exit::FAILURE)
        }
    }
}
