//! CLI argument parsing for ttscope.

use std::path::PathBuf;

use clap::Parser;

use crate::core::context::Options;
use crate::Config;

#[derive(Parser, Debug)]
#[command(name = "ttscope")]
#[command(version)]
#[command(
    about = "Analyze one or more Homa timetrace files and print information \
             extracted from them. Command-line arguments determine which \
             analyses to perform."
)]
pub struct Cli {
    /// Space-separated list of analyzers to apply to the trace files
    #[arg(short, long, value_name = "A", default_value = "all")]
    pub analyzers: String,

    /// Write data files (suitable for graphing) into this directory; no
    /// data files are generated without it
    #[arg(short, long, value_name = "DIR")]
    pub data: Option<PathBuf>,

    /// Don't print warnings when negative delays are encountered
    #[arg(long)]
    pub negative_ok: bool,

    /// Print additional output with more details
    #[arg(short, long)]
    pub verbose: bool,

    /// Trace files to analyze
    #[arg(value_name = "TRACE", required = true)]
    pub files: Vec<PathBuf>,
}

impl Cli {
    pub fn into_config(self) -> Config {
        Config {
            analyzers: self
                .analyzers
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            options: Options {
                negative_ok: self.negative_ok,
                verbose: self.verbose,
                data_dir: self.data,
            },
            files: self.files,
        }
    }
}
