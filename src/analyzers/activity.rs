//! Statistics about how many messages are active per host and the data
//! throughput they achieve, computed with a single sweep over start/end
//! markers.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Result;

use crate::analyzers::Analyzer;
use crate::core::context::RunContext;
use crate::stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepStats {
    /// Total number of start markers.
    pub num_starts: usize,
    /// Fraction of the total span during which at least one interval was
    /// active.
    pub active_frac: f64,
    /// Time-weighted average number of active intervals.
    pub avg_active: f64,
}

/// Sweep once over `markers`, which must be sorted by time and non-empty,
/// maintaining a running active count. For each inter-marker interval the
/// sweep accrues wall-clock time with a nonzero count and the time-weighted
/// integral of the count.
pub fn sweep(markers: &[(f64, Marker)]) -> SweepStats {
    let mut num_starts = 0;
    let mut cur_active: i64 = 0;
    let mut active_time = 0.0;
    let mut active_integral = 0.0;
    let mut last_time = markers[0].0;

    for &(time, marker) in markers {
        let delta = time - last_time;
        if cur_active > 0 {
            active_time += delta;
        }
        active_integral += delta * cur_active as f64;
        match marker {
            Marker::Start => {
                num_starts += 1;
                cur_active += 1;
            }
            Marker::End => cur_active -= 1,
        }
        last_time = time;
    }
    let total = markers[markers.len() - 1].0 - markers[0].0;
    if total <= 0.0 {
        return SweepStats {
            num_starts,
            active_frac: 0.0,
            avg_active: 0.0,
        };
    }
    SweepStats {
        num_starts,
        active_frac: active_time / total,
        avg_active: active_integral / total,
    }
}

pub struct ActivityAnalyzer;

impl ActivityAnalyzer {
    pub fn new() -> ActivityAnalyzer {
        ActivityAnalyzer
    }
}

impl Default for ActivityAnalyzer {
    fn default() -> ActivityAnalyzer {
        ActivityAnalyzer::new()
    }
}

fn write_row(
    w: &mut dyn Write,
    node: &str,
    markers: &mut Vec<(f64, Marker)>,
    num_bytes: u64,
    elapsed: f64,
    extra: &str,
) -> Result<()> {
    markers.sort_by(|a, b| a.0.total_cmp(&b.0));
    let stats = sweep(markers);
    let span = markers[markers.len() - 1].0 - markers[0].0;
    let rate = if span > 0.0 {
        stats.num_starts as f64 / span
    } else {
        0.0
    };
    let gbps = if elapsed > 0.0 {
        stats::gbps(num_bytes, elapsed)
    } else {
        0.0
    };
    let actv_gbps = if stats.active_frac > 0.0 {
        gbps / stats.active_frac
    } else {
        0.0
    };
    writeln!(
        w,
        "{:<10} {:>6} {:>7.3} {:>9.3} {:>8.2} {:>7.2}  {:>7.2}{}",
        node, stats.num_starts, rate, stats.active_frac, stats.avg_active, gbps, actv_gbps, extra
    )?;
    Ok(())
}

impl Analyzer for ActivityAnalyzer {
    fn name(&self) -> &'static str {
        "activity"
    }

    fn description(&self) -> &'static str {
        "Prints statistics about how many RPCs are active and data throughput"
    }

    fn needs_rpcs(&self) -> bool {
        true
    }

    fn write(&self, ctx: &RunContext, w: &mut dyn Write) -> Result<()> {
        // Start/end markers per node, one pair per message, for each
        // direction. When a message straddles a trace boundary the trace's
        // own bounds stand in for the unseen start or end.
        let mut node_in: BTreeMap<&str, Vec<(f64, Marker)>> = BTreeMap::new();
        let mut node_out: BTreeMap<&str, Vec<(f64, Marker)>> = BTreeMap::new();
        let mut node_core_in_bytes: BTreeMap<&str, BTreeMap<u32, u64>> = BTreeMap::new();
        let mut node_out_bytes: BTreeMap<&str, u64> = BTreeMap::new();

        for rpc in ctx.rpcs.values() {
            let trace = match ctx.traces.get(&rpc.node) {
                Some(trace) => trace,
                None => continue,
            };
            let node = rpc.node.as_str();

            let gros = &rpc.gro_data;
            if !gros.is_empty() {
                // The input message normally starts when GRO sees the first
                // data packet; if offset 0 never shows up, the message was
                // already in progress when the trace began.
                let in_start = if gros.iter().any(|g| g.offset == 0) {
                    gros[0].time
                } else {
                    trace.first()
                };
                let in_end = rpc.recvmsg_done.unwrap_or_else(|| trace.last());
                let markers = node_in.entry(node).or_default();
                markers.push((in_start, Marker::Start));
                markers.push((in_end, Marker::End));

                let min_offset = gros.iter().map(|g| g.offset).min().unwrap();
                let max_offset = gros.iter().map(|g| g.offset).max().unwrap();
                let bytes = match (rpc.recvmsg_done, rpc.in_length) {
                    (Some(_), Some(len)) => len.saturating_sub(min_offset),
                    _ => max_offset + ctx.packet_size() - min_offset,
                };
                if let Some(core) = rpc.gro_core {
                    *node_core_in_bytes
                        .entry(node)
                        .or_default()
                        .entry(core)
                        .or_insert(0) += bytes;
                }
            }

            if !rpc.send_data.is_empty() {
                let out_start = rpc.sendmsg.unwrap_or_else(|| trace.first());
                let last = rpc.send_data[rpc.send_data.len() - 1];
                let mut out_end = last.time;
                if let Some(out_len) = rpc.out_length {
                    if last.offset + last.length != out_len {
                        // The tail of the message was never sent inside the
                        // captured window.
                        out_end = trace.last();
                    }
                }
                let markers = node_out.entry(node).or_default();
                markers.push((out_start, Marker::Start));
                markers.push((out_end, Marker::End));
                *node_out_bytes.entry(node).or_insert(0) +=
                    rpc.send_data.iter().map(|p| p.length).sum::<u64>();
            }
        }

        writeln!(w)?;
        writeln!(w, "------------------")?;
        writeln!(w, "Analyzer: activity")?;
        writeln!(w, "------------------")?;
        writeln!(w)?;
        writeln!(w, "Msgs:          Total number of incoming/outgoing messages")?;
        writeln!(w, "MsgRate:       Rate at which new messages arrived (M/sec)")?;
        writeln!(
            w,
            "ActvFrac:      Fraction of time when at least one message was active"
        )?;
        writeln!(w, "AvgActv:       Average number of active messages")?;
        writeln!(w, "Gbps:          Total message throughput (Gbps)")?;
        writeln!(
            w,
            "ActvGbps:      Total throughput when at least one message was active (Gbps)"
        )?;
        writeln!(
            w,
            "MaxCore:       Highest incoming throughput via a single GRO core (Gbps)"
        )?;
        writeln!(w)?;
        writeln!(w, "Incoming messages:")?;
        writeln!(
            w,
            "Node         Msgs MsgRate  ActvFrac  AvgActv    Gbps ActvGbps       MaxCore"
        )?;
        writeln!(
            w,
            "---------------------------------------------------------------------------"
        )?;
        for node in ctx.sorted_nodes() {
            let elapsed = ctx.traces.get(node).map(|t| t.elapsed()).unwrap_or(0.0);
            match node_in.get_mut(node.as_str()) {
                Some(markers) if !markers.is_empty() => {
                    let mut max_core = 0;
                    let mut max_bytes = 0;
                    let mut total_bytes = 0;
                    if let Some(cores) = node_core_in_bytes.get(node.as_str()) {
                        for (&core, &bytes) in cores {
                            total_bytes += bytes;
                            if bytes > max_bytes {
                                max_bytes = bytes;
                                max_core = core;
                            }
                        }
                    }
                    let max_gbps = if elapsed > 0.0 {
                        stats::gbps(max_bytes, elapsed)
                    } else {
                        0.0
                    };
                    let extra = format!(" {:>7.2} (C{:02})", max_gbps, max_core);
                    write_row(w, node, markers, total_bytes, elapsed, &extra)?;
                }
                _ => writeln!(w, "{:<10}   no data", node)?,
            }
        }
        writeln!(w)?;
        writeln!(w, "Outgoing messages:")?;
        writeln!(
            w,
            "Node         Msgs MsgRate  ActvFrac  AvgActv    Gbps ActvGbps"
        )?;
        writeln!(
            w,
            "-------------------------------------------------------------"
        )?;
        for node in ctx.sorted_nodes() {
            let elapsed = ctx.traces.get(node).map(|t| t.elapsed()).unwrap_or(0.0);
            match node_out.get_mut(node.as_str()) {
                Some(markers) if !markers.is_empty() => {
                    let bytes = node_out_bytes.get(node.as_str()).copied().unwrap_or(0);
                    write_row(w, node, markers, bytes, elapsed, "")?;
                }
                _ => writeln!(w, "{:<10}   no data", node)?,
            }
        }
        Ok(())
    }
}
