//! ttscope analyzes Homa timetrace files: it reconstructs per-RPC state
//! from the traces of every host involved and prints cross-cutting
//! performance statistics (throughput, copy bandwidth, network delay and
//! backlog, phase latencies).
//!
//! The library is driven by a small binary: build a [`Config`], then call
//! [`run`]. All files are ingested before any analysis runs; a receiver's
//! packets may be matched against a sender in a different file, so the
//! ingest-everything-then-analyze ordering is load-bearing.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

pub mod analyzers;
pub mod cli;
pub mod core;
pub mod stats;

use crate::core::context::{Options, RunContext};
use crate::core::dispatch::{ConfigError, Dispatcher};

/// Everything one analysis run needs: which analyzers to apply, their
/// options, and the trace files to read.
#[derive(Debug, Clone)]
pub struct Config {
    /// Analyzer names; "all" expands to every analyzer.
    pub analyzers: Vec<String>,
    pub options: Options,
    pub files: Vec<PathBuf>,
}

/// Run one full analysis: validate the configuration, ingest every trace
/// file in order, then let each analyzer write its report section (and any
/// data files) in registration order.
pub fn run(config: Config, w: &mut dyn Write) -> Result<()> {
    if config.files.is_empty() {
        bail!("no trace files specified");
    }
    let names: Vec<String> = if config.analyzers.iter().any(|n| n == "all") {
        analyzers::ALL.iter().map(|s| s.to_string()).collect()
    } else {
        config.analyzers.clone()
    };

    let mut dispatcher = Dispatcher::new();
    for name in &names {
        let analyzer = analyzers::create(name)
            .ok_or_else(|| ConfigError::UnknownAnalyzer(name.clone()))?;
        dispatcher.register(analyzer)?;
    }
    for file in &config.files {
        if !file.exists() {
            bail!("trace file {} does not exist", file.display());
        }
    }
    if let Some(dir) = &config.options.data_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data directory {}", dir.display()))?;
    }

    let data_dir = config.options.data_dir.clone();
    let mut ctx = RunContext::new(config.options);
    for file in &config.files {
        dispatcher.parse_file(&mut ctx, file)?;
    }
    ctx.finish_ingest();

    dispatcher.write_reports(&ctx, w)?;
    if let Some(dir) = &data_dir {
        dispatcher.write_data(&ctx, dir)?;
    }
    Ok(())
}
