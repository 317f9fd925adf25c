//! The analyzers: each consumes events and/or the reconstructed RPC table
//! and writes one section of the report.

use std::io::Write;
use std::path::Path;

use anyhow::Result;

use crate::core::context::RunContext;
use crate::core::types::Event;

pub mod activity;
pub mod copy;
pub mod net;
pub mod timeline;

/// One analysis pass. Interests are declared as data: the dispatcher only
/// attempts shapes some registered analyzer asked for, and delivers each
/// event to its subscribers synchronously, in registration order.
pub trait Analyzer {
    /// Name used on the command line and in headings.
    fn name(&self) -> &'static str;

    /// One-line description for `--help`.
    fn description(&self) -> &'static str;

    /// Shape names this analyzer wants delivered to `record`.
    fn interests(&self) -> &'static [&'static str] {
        &[]
    }

    /// True when this analyzer reads the RPC table; the dispatcher
    /// registers the `rpc` ingest handler ahead of it.
    fn needs_rpcs(&self) -> bool {
        false
    }

    /// Called for every event matching one of this analyzer's interests,
    /// in file order, before the next line is read.
    fn record(&mut self, _ctx: &mut RunContext, _node: &str, _event: &Event) {}

    /// Write this analyzer's report section. Runs only after every trace
    /// file has been ingested.
    fn write(&self, ctx: &RunContext, w: &mut dyn Write) -> Result<()>;

    /// Write auxiliary data files into `dir`, if this analyzer has any.
    fn write_data(&self, _ctx: &RunContext, _dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Every analyzer name `create` understands, in report order.
pub const ALL: &[&str] = &["activity", "copy", "net", "rpc", "timeline"];

/// Look up an analyzer by name.
pub fn create(name: &str) -> Option<Box<dyn Analyzer>> {
    match name {
        "activity" => Some(Box::new(activity::ActivityAnalyzer::new())),
        "copy" => Some(Box::new(copy::CopyAnalyzer::new())),
        "net" => Some(Box::new(net::NetAnalyzer::new())),
        "rpc" => Some(Box::new(crate::core::rpc::RpcIngest::new())),
        "timeline" => Some(Box::new(timeline::TimelineAnalyzer::new())),
        _ => None,
    }
}

/// One "name: description" line per analyzer, for help output.
pub fn describe_all() -> String {
    let mut out = String::new();
    for name in ALL {
        let analyzer = create(name).unwrap();
        out.push_str(&format!("{}: {}\n", name, analyzer.description()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_every_listed_analyzer() {
        for name in ALL {
            let analyzer = create(name).unwrap();
            assert_eq!(analyzer.name(), *name);
        }
        assert!(create("bogus").is_none());
    }
}
