//! Throughput of data copies between user space and kernel space, tracked
//! with a small per-core state machine on each node.

use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;

use crate::analyzers::Analyzer;
use crate::core::context::RunContext;
use crate::core::types::{Event, EventKind};
use crate::stats;

/// Copies at most this many bytes feed the short-block latency
/// percentiles.
const SMALL_MAX: u64 = 1000;
/// Copies of at least this many bytes feed the long-block throughput
/// accumulators. Sizes between the two thresholds count toward neither
/// bucket.
const LARGE_MIN: u64 = 5000;

/// Accumulators for one copy direction on one node.
#[derive(Debug, Default)]
struct DirStats {
    /// Per core: when the most recent copy started.
    start: HashMap<u32, f64>,
    /// Total bytes copied in long blocks.
    large_data: u64,
    /// Total time spent copying long blocks (usec).
    large_time: f64,
    large_count: u64,
    /// Elapsed times for short blocks.
    small_times: Vec<f64>,
    /// Total time spent copying, all sizes.
    total_time: f64,
}

impl DirStats {
    /// Close out a copy on `core`, bucketing it by size. Returns the
    /// elapsed time, or None when no start was recorded on that core
    /// (trace truncation).
    fn finish(&mut self, core: u32, time: f64, bytes: u64) -> Option<f64> {
        let start = *self.start.get(&core)?;
        let delta = time - start;
        self.total_time += delta;
        if bytes <= SMALL_MAX {
            self.small_times.push(delta);
        } else if bytes >= LARGE_MIN {
            self.large_data += bytes;
            self.large_time += delta;
            self.large_count += 1;
        }
        Some(delta)
    }
}

/// Per-node state: both directions plus the bookkeeping needed to charge
/// skb-freeing time against the copy that preceded it.
#[derive(Debug, Default)]
struct CopyState {
    copy_in: DirStats,
    copy_out: DirStats,
    /// Per core: when the most recent copy to user space ended.
    out_end: HashMap<u32, f64>,
    /// Per core: size of the most recent copy to user space.
    out_size: HashMap<u32, u64>,
    /// Long-block copy-out time including subsequent skb freeing.
    large_out_time_with_skbs: f64,
    skbs_freed: u64,
    skb_free_time: f64,
}

pub struct CopyAnalyzer {
    nodes: HashMap<String, CopyState>,
}

impl CopyAnalyzer {
    pub fn new() -> CopyAnalyzer {
        CopyAnalyzer {
            nodes: HashMap::new(),
        }
    }
}

impl Default for CopyAnalyzer {
    fn default() -> CopyAnalyzer {
        CopyAnalyzer::new()
    }
}

const COPY_SHAPES: &[&str] = &[
    "copy_in_start",
    "copy_in_done",
    "copy_out_start",
    "copy_out_done",
    "free_skbs",
];

impl Analyzer for CopyAnalyzer {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn description(&self) -> &'static str {
        "Measures the throughput of copies between user space and kernel space"
    }

    fn interests(&self) -> &'static [&'static str] {
        COPY_SHAPES
    }

    fn record(&mut self, ctx: &mut RunContext, node: &str, event: &Event) {
        let state = self.nodes.entry(node.to_string()).or_default();
        match event.kind {
            EventKind::CopyInStart => {
                state.copy_in.start.insert(event.core, event.time);
            }
            EventKind::CopyInDone { bytes, .. } => {
                if let Some(delta) = state.copy_in.finish(event.core, event.time, bytes) {
                    if ctx.options.verbose {
                        println!(
                            "{:>9.3} Copy in finished [C{:02}]: {} bytes, {:.1} us, {:>5.1} Gbps",
                            event.time,
                            event.core,
                            bytes,
                            delta,
                            stats::gbps(bytes, delta)
                        );
                    }
                }
            }
            EventKind::CopyOutStart { .. } => {
                state.copy_out.start.insert(event.core, event.time);
            }
            EventKind::CopyOutDone { bytes, .. } => {
                if let Some(delta) = state.copy_out.finish(event.core, event.time, bytes) {
                    state.out_end.insert(event.core, event.time);
                    state.out_size.insert(event.core, bytes);
                    if bytes >= LARGE_MIN {
                        state.large_out_time_with_skbs += delta;
                    }
                    if ctx.options.verbose {
                        println!(
                            "{:>9.3} Copy out finished [C{:02}]: {} bytes, {:.1} us, {:>5.1} Gbps",
                            event.time,
                            event.core,
                            bytes,
                            delta,
                            stats::gbps(bytes, delta)
                        );
                    }
                }
            }
            EventKind::FreeSkbs { count } => {
                if let Some(&end) = state.out_end.get(&event.core) {
                    let delta = event.time - end;
                    state.skbs_freed += count;
                    state.skb_free_time += delta;
                    if state.out_size.get(&event.core).copied().unwrap_or(0) >= LARGE_MIN {
                        state.large_out_time_with_skbs += delta;
                    }
                }
            }
            _ => {}
        }
    }

    fn write(&self, ctx: &RunContext, w: &mut dyn Write) -> Result<()> {
        writeln!(w)?;
        writeln!(w, "--------------")?;
        writeln!(w, "Analyzer: copy")?;
        writeln!(w, "--------------")?;
        writeln!(
            w,
            "Performance of data copying between user space and kernel:"
        )?;
        writeln!(w, "Node:     Name of node")?;
        writeln!(w, "#Short:   Number of short blocks copied (<= 1000 B)")?;
        writeln!(w, "Min:      Minimum copy time for a short block (usec)")?;
        writeln!(w, "P50:      Median copy time for short blocks (usec)")?;
        writeln!(w, "P90:      90th percentile copy time for short blocks (usec)")?;
        writeln!(w, "P99:      99th percentile copy time for short blocks (usec)")?;
        writeln!(w, "Max:      Maximum copy time for a short block (usec)")?;
        writeln!(w, "Avg:      Average copy time for short blocks (usec)")?;
        writeln!(w, "#Long:    Number of long blocks copied (>= 5000 B)")?;
        writeln!(w, "TputC:    Average per-core throughput for copying long blocks")?;
        writeln!(w, "          when actively copying (Gbps)")?;
        writeln!(w, "TputN:    Average long block copy throughput for the node (Gbps)")?;
        writeln!(w, "Cores:    Average number of cores copying long blocks")?;
        writeln!(w)?;
        writeln!(w, "Copying from user space to kernel:")?;
        self.write_direction(ctx, w, |state| &state.copy_in)?;
        writeln!(w)?;
        writeln!(w, "Copying from kernel space to user:")?;
        self.write_direction(ctx, w, |state| &state.copy_out)?;

        writeln!(w)?;
        writeln!(
            w,
            "Impact of freeing socket buffers while copying to user:"
        )?;
        writeln!(w, "Node:     Name of node")?;
        writeln!(w, "#Freed:   Number of skbs freed")?;
        writeln!(w, "Time:     Average time to free an skb (usec)")?;
        writeln!(
            w,
            "Tput:     Effective kernel->user throughput per core (TputC) including"
        )?;
        writeln!(w, "          skb freeing (Gbps)")?;
        writeln!(w)?;
        writeln!(w, "Node       #Freed   Time   Tput")?;
        writeln!(w, "-------------------------------")?;
        let empty = CopyState::default();
        for node in ctx.sorted_nodes() {
            let state = self.nodes.get(node.as_str()).unwrap_or(&empty);
            let (free_time, tput) = if state.skbs_freed == 0 {
                (0.0, "   N/A".to_string())
            } else {
                let tput = if state.large_out_time_with_skbs > 0.0 {
                    format!(
                        "{:>6.1}",
                        stats::gbps(state.copy_out.large_data, state.large_out_time_with_skbs)
                    )
                } else {
                    "   N/A".to_string()
                };
                (state.skb_free_time / state.skbs_freed as f64, tput)
            };
            writeln!(
                w,
                "{:<10} {:>6} {:>6.2} {}",
                node, state.skbs_freed, free_time, tput
            )?;
        }
        Ok(())
    }
}

impl CopyAnalyzer {
    fn write_direction(
        &self,
        ctx: &RunContext,
        w: &mut dyn Write,
        pick: fn(&CopyState) -> &DirStats,
    ) -> Result<()> {
        writeln!(
            w,
            "Node       #Short   Min   P50   P90   P99   Max   Avg  #Long  TputC TputN Cores"
        )?;
        writeln!(
            w,
            "-------------------------------------------------------------------------------"
        )?;
        let empty = CopyState::default();
        for node in ctx.sorted_nodes() {
            let elapsed = ctx.traces.get(node).map(|t| t.elapsed()).unwrap_or(0.0);
            let dir = pick(self.nodes.get(node.as_str()).unwrap_or(&empty));
            let summary = stats::summarize(&dir.small_times);
            let (min, p50, p90, p99, max, avg) = match summary {
                Some(s) => (s.min, s.p50, s.p90, s.p99, s.max, s.avg),
                None => (0.0, 0.0, 0.0, 0.0, 0.0, 0.0),
            };
            let (core_tput, node_tput, cores) = if dir.large_time == 0.0 {
                ("   N/A".to_string(), "   N/A".to_string(), 0.0)
            } else {
                let node_tput = if elapsed > 0.0 {
                    format!("{:>6.1}", stats::gbps(dir.large_data, elapsed))
                } else {
                    "   N/A".to_string()
                };
                let cores = if elapsed > 0.0 {
                    dir.total_time / elapsed
                } else {
                    0.0
                };
                (
                    format!("{:>6.1}", stats::gbps(dir.large_data, dir.large_time)),
                    node_tput,
                    cores,
                )
            };
            writeln!(
                w,
                "{:<10} {:>6}{:>6.1}{:>6.1}{:>6.1}{:>6.1}{:>6.1}{:>6.1}  {:>5} {}{} {:>5.2}",
                node,
                dir.small_times.len(),
                min,
                p50,
                p90,
                p99,
                max,
                avg,
                dir.large_count,
                core_tput,
                node_tput,
                cores
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::core::context::Options;
    use crate::core::types::Trace;

    fn ev(time: f64, core: u32, kind: EventKind) -> Event {
        Event { time, core, kind }
    }

    fn run_events(events: Vec<Event>) -> (CopyAnalyzer, RunContext) {
        let mut ctx = RunContext::new(Options::default());
        let mut trace = Trace::new("node1".to_string(), Path::new("node1.tt"));
        trace.observe(0.0);
        trace.observe(100.0);
        ctx.traces.insert("node1".to_string(), trace);
        let mut analyzer = CopyAnalyzer::new();
        for event in &events {
            analyzer.record(&mut ctx, "node1", event);
        }
        ctx.finish_ingest();
        (analyzer, ctx)
    }

    #[test]
    fn small_copies_feed_latency_samples() {
        let (analyzer, _) = run_events(vec![
            ev(1.0, 2, EventKind::CopyInStart),
            ev(3.5, 2, EventKind::CopyInDone { id: 4, bytes: 800 }),
        ]);
        let dir = &analyzer.nodes["node1"].copy_in;
        assert_eq!(dir.small_times, vec![2.5]);
        assert_eq!(dir.large_count, 0);
        assert_eq!(dir.total_time, 2.5);
    }

    #[test]
    fn large_copies_feed_throughput_accumulators() {
        let (analyzer, _) = run_events(vec![
            ev(1.0, 2, EventKind::CopyInStart),
            ev(5.0, 2, EventKind::CopyInDone { id: 4, bytes: 8000 }),
        ]);
        let dir = &analyzer.nodes["node1"].copy_in;
        assert!(dir.small_times.is_empty());
        assert_eq!(dir.large_count, 1);
        assert_eq!(dir.large_data, 8000);
        assert_eq!(dir.large_time, 4.0);
    }

    #[test]
    fn mid_sized_copies_are_excluded_from_both_buckets() {
        let (analyzer, _) = run_events(vec![
            ev(1.0, 2, EventKind::CopyInStart),
            ev(2.0, 2, EventKind::CopyInDone { id: 4, bytes: 3000 }),
        ]);
        let dir = &analyzer.nodes["node1"].copy_in;
        assert!(dir.small_times.is_empty());
        assert_eq!(dir.large_count, 0);
        // Still counted toward overall copying time.
        assert_eq!(dir.total_time, 1.0);
    }

    #[test]
    fn done_without_start_is_ignored() {
        let (analyzer, _) = run_events(vec![ev(
            2.0,
            2,
            EventKind::CopyInDone { id: 4, bytes: 800 },
        )]);
        let dir = &analyzer.nodes["node1"].copy_in;
        assert!(dir.small_times.is_empty());
        assert_eq!(dir.total_time, 0.0);
    }

    #[test]
    fn skb_freeing_extends_release_inclusive_time() {
        let (analyzer, _) = run_events(vec![
            ev(1.0, 2, EventKind::CopyOutStart { id: 5 }),
            ev(4.0, 2, EventKind::CopyOutDone { id: 5, bytes: 9000 }),
            ev(6.0, 2, EventKind::FreeSkbs { count: 4 }),
        ]);
        let state = &analyzer.nodes["node1"];
        assert_eq!(state.copy_out.large_time, 3.0);
        assert_eq!(state.large_out_time_with_skbs, 5.0);
        assert_eq!(state.skbs_freed, 4);
        assert_eq!(state.skb_free_time, 2.0);
    }

    #[test]
    fn skb_freeing_after_small_copy_not_charged_to_large_bucket() {
        let (analyzer, _) = run_events(vec![
            ev(1.0, 2, EventKind::CopyOutStart { id: 5 }),
            ev(2.0, 2, EventKind::CopyOutDone { id: 5, bytes: 500 }),
            ev(3.0, 2, EventKind::FreeSkbs { count: 1 }),
        ]);
        let state = &analyzer.nodes["node1"];
        assert_eq!(state.large_out_time_with_skbs, 0.0);
        assert_eq!(state.skbs_freed, 1);
        assert_eq!(state.skb_free_time, 1.0);
    }

    #[test]
    fn report_renders_na_for_empty_node() {
        let (analyzer, ctx) = run_events(vec![]);
        let mut out = Vec::new();
        analyzer.write(&ctx, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Analyzer: copy"));
        assert!(text.contains("N/A"));
    }
}
