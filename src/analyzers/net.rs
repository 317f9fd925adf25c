//! Network delay analysis: pairs every RPC with its sender-side
//! counterpart, matches transmitted packets against GRO receptions in
//! offset order, and reports per-core end-to-end delay and backlog (bytes
//! in flight between ip*_xmit and GRO).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use log::{debug, warn};

use crate::analyzers::Analyzer;
use crate::core::context::RunContext;
use crate::core::types::counterpart;

/// Width of a backlog-series bucket, in microseconds.
const INTERVAL_LENGTH: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NetKind {
    /// A run of bytes was passed to ip*_xmit on the sender.
    Xmit,
    /// A packet was processed by GRO on the receiver.
    Recv,
}

/// One entry of a receiver's merged transmit/receive stream.
#[derive(Debug, Clone, Copy, PartialEq)]
struct NetEvent {
    time: f64,
    kind: NetKind,
    /// Message bytes in the packet or run, capped at one full packet for
    /// receive events.
    bytes: u64,
    /// GRO core on the receiver.
    core: u32,
    /// End-to-end delay; zero for transmit events.
    delay: f64,
}

/// Matches up packet sends and receives for all RPCs. Returns, per
/// receiving node, that node's merged event stream in time order.
///
/// The walk advances a cursor through the sender's offset-sorted packets as
/// the receiver's offset-sorted GRO samples catch up to them. Receiver
/// packets with no known transmit record, and packets whose offset was
/// covered by a resend or retransmission, are excluded from delay
/// statistics; their timing is not representative.
fn collect_events(ctx: &RunContext) -> BTreeMap<String, Vec<NetEvent>> {
    let max_data = ctx.packet_size();
    let mut receivers: BTreeMap<String, Vec<NetEvent>> = BTreeMap::new();

    for (&xmit_id, xmit_rpc) in &ctx.rpcs {
        let recv_id = counterpart(xmit_id);
        let recv_rpc = match ctx.rpcs.get(&recv_id) {
            Some(rpc) => rpc,
            None => continue,
        };
        let core = match recv_rpc.gro_core {
            Some(core) => core,
            None => continue,
        };

        let mut xmit_pkts = xmit_rpc.send_data.clone();
        xmit_pkts.sort_by_key(|p| p.offset);
        let xmit_end = if let Some(last) = xmit_pkts.last() {
            last.offset + last.length
        } else if let Some(len) = xmit_rpc.out_length {
            len
        } else if let Some(len) = recv_rpc.in_length {
            len
        } else {
            // Not enough information to place this RPC's packets.
            continue;
        };
        let mut recv_pkts = recv_rpc.gro_data.clone();
        recv_pkts.sort_by_key(|p| p.offset);

        let events = receivers.entry(recv_rpc.node.clone()).or_default();

        let mut xmit_ix = 0;
        let (mut xmit_time, mut xmit_offset, mut xmit_length) = match xmit_pkts.first() {
            Some(p) => (p.time, p.offset, p.length),
            None => (0.0, u64::MAX, 0),
        };
        let mut xmit_bytes: u64 = 0;
        for i in 0..recv_pkts.len() {
            let recv_time = recv_pkts[i].time;
            let recv_offset = recv_pkts[i].offset;
            let mut length = if i == recv_pkts.len() - 1 {
                xmit_end.saturating_sub(recv_offset)
            } else {
                recv_pkts[i + 1].offset - recv_offset
            };
            if length > max_data {
                length = max_data;
            }

            if recv_offset < xmit_offset {
                // No transmit record for this packet.
                continue;
            }
            while recv_offset >= xmit_offset.saturating_add(xmit_length) {
                if xmit_bytes > 0 {
                    events.push(NetEvent {
                        time: xmit_time,
                        kind: NetKind::Xmit,
                        bytes: xmit_bytes,
                        core,
                        delay: 0.0,
                    });
                    xmit_bytes = 0;
                }
                xmit_ix += 1;
                if xmit_ix >= xmit_pkts.len() {
                    break;
                }
                let p = xmit_pkts[xmit_ix];
                xmit_time = p.time;
                xmit_offset = p.offset;
                xmit_length = p.length;
            }
            if xmit_ix >= xmit_pkts.len() {
                // Receiver trace extends beyond sender trace; ignore extras.
                break;
            }
            if recv_rpc.resends.contains_key(&recv_offset)
                || xmit_rpc.retransmits.contains_key(&recv_offset)
            {
                // Both maps must be checked: either end may have logged the
                // recovery for this offset.
                continue;
            }
            let delay = recv_time - xmit_time;
            events.push(NetEvent {
                time: recv_time,
                kind: NetKind::Recv,
                bytes: length,
                core,
                delay,
            });
            if delay < 0.0 && !ctx.options.negative_ok {
                warn!(
                    "negative delay {:.3} us: packet sent at {:.3} (id {}), \
                     received at {:.3} (id {}) on {}",
                    delay, xmit_time, xmit_id, recv_time, recv_id, recv_rpc.node
                );
            }
            xmit_bytes += length;
        }
        if xmit_bytes > 0 {
            events.push(NetEvent {
                time: xmit_time,
                kind: NetKind::Xmit,
                bytes: xmit_bytes,
                core,
                delay: 0.0,
            });
        }
    }

    for events in receivers.values_mut() {
        events.sort_by(|a, b| a.time.total_cmp(&b.time));
    }
    receivers
}

/// Per-core delay and backlog summary for one node.
#[derive(Debug, Clone, Copy, Default)]
struct CoreSummary {
    num_packets: u64,
    delay_sum: f64,
    avg_delay: f64,
    max_delay: f64,
    max_delay_time: f64,
    backlog_integral: f64,
    avg_backlog: f64,
    cur_backlog: i64,
    max_backlog: i64,
    max_backlog_time: f64,
    prev_time: f64,
}

/// Second pass over the merged streams: per core, packet counts, delay
/// statistics, and the time-weighted backlog average and peak.
fn summarize_events(
    ctx: &RunContext,
    events: &BTreeMap<String, Vec<NetEvent>>,
) -> BTreeMap<String, BTreeMap<u32, CoreSummary>> {
    let mut nodes: BTreeMap<String, BTreeMap<u32, CoreSummary>> = BTreeMap::new();
    for (name, node_events) in events {
        let node = nodes.entry(name.clone()).or_default();
        for ev in node_events {
            let cd = node.entry(ev.core).or_default();
            cd.backlog_integral += cd.cur_backlog as f64 * (ev.time - cd.prev_time);
            match ev.kind {
                NetKind::Recv => {
                    cd.num_packets += 1;
                    cd.delay_sum += ev.delay;
                    if ev.delay > cd.max_delay {
                        cd.max_delay = ev.delay;
                        cd.max_delay_time = ev.time;
                    }
                    if cd.cur_backlog == cd.max_backlog {
                        cd.max_backlog_time = ev.time;
                    }
                    cd.cur_backlog -= ev.bytes as i64;
                }
                NetKind::Xmit => {
                    cd.cur_backlog += ev.bytes as i64;
                    if cd.cur_backlog > cd.max_backlog {
                        cd.max_backlog = cd.cur_backlog;
                    }
                }
            }
            cd.prev_time = ev.time;
        }
        let elapsed = ctx.traces.get(name).map(|t| t.elapsed()).unwrap_or(0.0);
        for cd in node.values_mut() {
            if cd.num_packets > 0 {
                cd.avg_delay = cd.delay_sum / cd.num_packets as f64;
            }
            if elapsed > 0.0 {
                cd.avg_backlog = cd.backlog_integral / elapsed;
            }
        }
    }
    nodes
}

fn generation_header(w: &mut dyn Write, node: &str) -> Result<()> {
    writeln!(w, "# Node: {}", node)?;
    writeln!(
        w,
        "# Generated at {}.",
        Local::now().format("%I:%M %p on %m/%d/%Y")
    )?;
    Ok(())
}

/// One data file per node: (time, delay) pairs for each active GRO core.
fn write_delay_file(dir: &Path, node: &str, node_events: &[NetEvent]) -> Result<()> {
    let mut core_data: BTreeMap<u32, Vec<(f64, f64)>> = BTreeMap::new();
    for ev in node_events {
        if ev.kind == NetKind::Recv {
            core_data.entry(ev.core).or_default().push((ev.time, ev.delay));
        }
    }

    let path = dir.join(format!("net_delay_{}.dat", node));
    let mut f = File::create(&path)
        .with_context(|| format!("failed to create data file {}", path.display()))?;
    generation_header(&mut f, node)?;
    writeln!(
        f,
        "# Packet delay information for a single node, broken out by the core"
    )?;
    writeln!(
        f,
        "# where the packet is processed by GRO. For each active core there are"
    )?;
    writeln!(
        f,
        "# two columns, TimeN and DelayN. Each line corresponds to a packet"
    )?;
    writeln!(
        f,
        "# that was processed by homa_gro_receive on core N at the given time"
    )?;
    writeln!(
        f,
        "# with the given delay (measured end to end from ip_*xmit call to"
    )?;
    writeln!(f, "# homa_gro_receive call)")?;
    let max_len = core_data.values().map(|pkts| pkts.len()).max().unwrap_or(0);
    for core in core_data.keys() {
        write!(f, "{:>8}{:>8}", format!("Time{}", core), format!("Delay{}", core))?;
    }
    writeln!(f)?;
    for i in 0..max_len {
        for pkts in core_data.values() {
            if i < pkts.len() {
                write!(f, "{:>8.1} {:>7.1}", pkts[i].0, pkts[i].1)?;
            } else {
                write!(f, "{:16}", "")?;
            }
        }
        writeln!(f)?;
    }
    Ok(())
}

/// One data file per node: per-core backlog (KB) at the end of each
/// fixed-width time interval.
fn write_backlog_file(dir: &Path, node: &str, node_events: &[NetEvent]) -> Result<()> {
    let mut backlogs: BTreeMap<u32, Vec<i64>> = BTreeMap::new();
    let start = (node_events[0].time / INTERVAL_LENGTH).floor() * INTERVAL_LENGTH;
    let mut interval_end = start + INTERVAL_LENGTH;
    let mut cur_interval = 0;

    for ev in node_events {
        while ev.time >= interval_end {
            interval_end += INTERVAL_LENGTH;
            cur_interval += 1;
            for series in backlogs.values_mut() {
                let last = *series.last().unwrap();
                series.push(last);
            }
        }
        let series = backlogs
            .entry(ev.core)
            .or_insert_with(|| vec![0; cur_interval + 1]);
        let last = series.last_mut().unwrap();
        match ev.kind {
            NetKind::Recv => *last -= ev.bytes as i64,
            NetKind::Xmit => *last += ev.bytes as i64,
        }
    }
    debug!("{}: {} backlog intervals", node, cur_interval);

    let path = dir.join(format!("net_backlog_{}.dat", node));
    let mut f = File::create(&path)
        .with_context(|| format!("failed to create data file {}", path.display()))?;
    generation_header(&mut f, node)?;
    writeln!(
        f,
        "# Time-series history of backlog for each active GRO core on this"
    )?;
    writeln!(
        f,
        "# node. Column \"BackC\" shows the backlog on core C at the given time"
    )?;
    writeln!(
        f,
        "# (in usec). Backlog is the KB of data destined for core C that have"
    )?;
    writeln!(
        f,
        "# been passed to ip*_xmit at the sender but not yet seen by"
    )?;
    writeln!(f, "# homa_gro_receive on the receiver.")?;
    write!(f, "    Time")?;
    for core in backlogs.keys() {
        write!(f, " {:>7}", format!("Back{}", core))?;
    }
    writeln!(f)?;
    for i in 0..cur_interval {
        write!(f, "{:>8.1}", start + (i as f64 + 1.0) * INTERVAL_LENGTH)?;
        for series in backlogs.values() {
            write!(f, " {:>7.1}", series[i] as f64 / 1000.0)?;
        }
        writeln!(f)?;
    }
    Ok(())
}

pub struct NetAnalyzer;

impl NetAnalyzer {
    pub fn new() -> NetAnalyzer {
        NetAnalyzer
    }
}

impl Default for NetAnalyzer {
    fn default() -> NetAnalyzer {
        NetAnalyzer::new()
    }
}

impl Analyzer for NetAnalyzer {
    fn name(&self) -> &'static str {
        "net"
    }

    fn description(&self) -> &'static str {
        "Prints information about network delays, congestion, and receiver GRO overload"
    }

    fn needs_rpcs(&self) -> bool {
        true
    }

    fn write(&self, ctx: &RunContext, w: &mut dyn Write) -> Result<()> {
        let events = collect_events(ctx);
        let summaries = summarize_events(ctx, &events);

        writeln!(w)?;
        writeln!(w, "-------------")?;
        writeln!(w, "Analyzer: net")?;
        writeln!(w, "-------------")?;
        writeln!(
            w,
            "Network delay (including sending NIC, network, receiving NIC, and GRO"
        )?;
        writeln!(
            w,
            "backup, for packets with GRO processing on a particular core."
        )?;
        writeln!(w, "Pkts:      Total data packets processed by Core on Node")?;
        writeln!(
            w,
            "AvgDelay:  Average end-to-end delay from ip_*xmit invocation to GRO (usec)"
        )?;
        writeln!(
            w,
            "MaxDelay:  Maximum end-to-end delay, and the time when the max packet was"
        )?;
        writeln!(w, "           processed by GRO (usec)")?;
        writeln!(
            w,
            "AvgBack:   Average backup for Core on Node (total data bytes that were"
        )?;
        writeln!(w, "           passed to ip_*xmit but not yet seen by GRO) (KB)")?;
        writeln!(
            w,
            "MaxBack:   Maximum backup for Core (KB) and the time when GRO processed"
        )?;
        writeln!(w, "           a packet from that backup")?;
        writeln!(w)?;
        writeln!(
            w,
            "Node       Core   Pkts  AvgDelay     MaxDelay (Time)    AvgBack     MaxBack (Time)"
        )?;
        write!(
            w,
            "------------------------------------------------------------------------------------"
        )?;
        for name in ctx.sorted_nodes() {
            let node = match summaries.get(name.as_str()) {
                Some(node) => node,
                None => continue,
            };
            writeln!(w)?;
            for (core, cd) in node {
                if cd.num_packets == 0 {
                    writeln!(w, "{:<10} {:>4} {:>6}   no data", name, core, 0)?;
                    continue;
                }
                writeln!(
                    w,
                    "{:<10} {:>4} {:>6} {:>9.1} {:>9.1} ({:>9.3}) {:>8.1} {:>8.1} ({:>9.3})",
                    name,
                    core,
                    cd.num_packets,
                    cd.avg_delay,
                    cd.max_delay,
                    cd.max_delay_time,
                    cd.avg_backlog * 1e-3,
                    cd.max_backlog as f64 * 1e-3,
                    cd.max_backlog_time
                )?;
            }
        }
        writeln!(w)?;
        Ok(())
    }

    fn write_data(&self, ctx: &RunContext, dir: &Path) -> Result<()> {
        let events = collect_events(ctx);
        for (name, node_events) in &events {
            if node_events.is_empty() {
                continue;
            }
            write_delay_file(dir, name, node_events)?;
            write_backlog_file(dir, name, node_events)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::core::context::Options;
    use crate::core::rpc::{PktSample, RpcRecord, SentPacket};
    use crate::core::types::Trace;

    fn base_ctx() -> RunContext {
        let mut ctx = RunContext::new(Options {
            negative_ok: true,
            ..Default::default()
        });
        for name in ["node1", "node2"] {
            let mut trace = Trace::new(name.to_string(), Path::new(name));
            trace.observe(0.0);
            trace.observe(10.0);
            ctx.traces.insert(name.to_string(), trace);
        }
        ctx
    }

    /// Sender rpc 2 on node2, receiver rpc 3 on node1.
    fn paired_rpcs(ctx: &mut RunContext, send: &[(f64, u64, u64)], recv: &[(f64, u64)]) {
        let mut xmit = RpcRecord::new("node2");
        for &(time, offset, length) in send {
            xmit.send_data.push(SentPacket {
                time,
                offset,
                length,
            });
        }
        ctx.rpcs.insert(2, xmit);
        let mut rx = RpcRecord::new("node1");
        for &(time, offset) in recv {
            rx.gro_data.push(PktSample { time, offset });
        }
        rx.gro_core = Some(4);
        ctx.rpcs.insert(3, rx);
    }

    #[test]
    fn delays_match_transmit_records() {
        let mut ctx = base_ctx();
        paired_rpcs(&mut ctx, &[(0.0, 0, 500), (1.0, 500, 500)], &[(2.0, 0), (3.0, 500)]);
        ctx.finish_ingest();

        let events = collect_events(&ctx);
        let node1 = &events["node1"];
        let recvs: Vec<&NetEvent> = node1.iter().filter(|e| e.kind == NetKind::Recv).collect();
        assert_eq!(recvs.len(), 2);
        assert_eq!(recvs[0].delay, 2.0);
        assert_eq!(recvs[1].delay, 2.0);
        assert_eq!(recvs[0].bytes, 500);
        assert_eq!(recvs[1].bytes, 500);

        let xmits: Vec<&NetEvent> = node1.iter().filter(|e| e.kind == NetKind::Xmit).collect();
        assert_eq!(xmits.len(), 2);
        assert_eq!((xmits[0].time, xmits[0].bytes), (0.0, 500));
        assert_eq!((xmits[1].time, xmits[1].bytes), (1.0, 500));
    }

    #[test]
    fn resent_offsets_are_excluded() {
        let mut ctx = base_ctx();
        paired_rpcs(&mut ctx, &[(0.0, 0, 500), (1.0, 500, 500)], &[(2.0, 0), (3.0, 500)]);
        ctx.rpcs.get_mut(&3).unwrap().resends.insert(500, 2.5);
        ctx.finish_ingest();

        let events = collect_events(&ctx);
        let recvs: Vec<&NetEvent> = events["node1"]
            .iter()
            .filter(|e| e.kind == NetKind::Recv)
            .collect();
        assert_eq!(recvs.len(), 1);
        assert_eq!(recvs[0].delay, 2.0);
    }

    #[test]
    fn retransmitted_offsets_are_excluded() {
        let mut ctx = base_ctx();
        paired_rpcs(&mut ctx, &[(0.0, 0, 500), (1.0, 500, 500)], &[(2.0, 0), (3.0, 500)]);
        ctx.rpcs
            .get_mut(&2)
            .unwrap()
            .retransmits
            .insert(0, (0.5, 500));
        ctx.finish_ingest();

        let events = collect_events(&ctx);
        let recvs: Vec<&NetEvent> = events["node1"]
            .iter()
            .filter(|e| e.kind == NetKind::Recv)
            .collect();
        assert_eq!(recvs.len(), 1);
        assert_eq!(recvs[0].delay, 2.0);
    }

    #[test]
    fn packets_before_first_transmit_record_are_skipped() {
        let mut ctx = base_ctx();
        // The sender's trace only caught the second packet.
        paired_rpcs(&mut ctx, &[(1.0, 500, 500)], &[(2.0, 0), (3.0, 500)]);
        ctx.finish_ingest();

        let events = collect_events(&ctx);
        let recvs: Vec<&NetEvent> = events["node1"]
            .iter()
            .filter(|e| e.kind == NetKind::Recv)
            .collect();
        assert_eq!(recvs.len(), 1);
        assert_eq!(recvs[0].time, 3.0);
    }

    #[test]
    fn backlog_summary_tracks_in_flight_bytes() {
        let mut ctx = base_ctx();
        paired_rpcs(&mut ctx, &[(0.0, 0, 500), (1.0, 500, 500)], &[(2.0, 0), (3.0, 500)]);
        ctx.finish_ingest();

        let events = collect_events(&ctx);
        let summaries = summarize_events(&ctx, &events);
        let cd = &summaries["node1"][&4];
        assert_eq!(cd.num_packets, 2);
        assert_eq!(cd.avg_delay, 2.0);
        assert_eq!(cd.max_delay, 2.0);
        assert_eq!(cd.max_delay_time, 2.0);
        assert_eq!(cd.max_backlog, 1000);
        assert_eq!(cd.max_backlog_time, 2.0);
        // Integral: 500B over [0,1), 1000B over [1,2), 500B over [2,3),
        // divided by the 10us trace span.
        assert!((cd.avg_backlog - 200.0).abs() < 1e-9);
    }

    #[test]
    fn negative_delays_are_kept_in_statistics() {
        let mut ctx = base_ctx();
        // Clock skew: the receiver logs the packet before the sender does.
        paired_rpcs(&mut ctx, &[(5.0, 0, 500)], &[(4.0, 0)]);
        ctx.rpcs.get_mut(&2).unwrap().out_length = Some(500);
        ctx.finish_ingest();

        let events = collect_events(&ctx);
        let recvs: Vec<&NetEvent> = events["node1"]
            .iter()
            .filter(|e| e.kind == NetKind::Recv)
            .collect();
        assert_eq!(recvs.len(), 1);
        assert_eq!(recvs[0].delay, -1.0);
    }

    #[test]
    fn unpaired_rpcs_produce_no_events() {
        let mut ctx = base_ctx();
        let mut xmit = RpcRecord::new("node2");
        xmit.send_data.push(SentPacket {
            time: 0.0,
            offset: 0,
            length: 500,
        });
        ctx.rpcs.insert(2, xmit);
        ctx.finish_ingest();
        assert!(collect_events(&ctx).is_empty());
    }

    #[test]
    fn data_files_are_written() {
        let mut ctx = base_ctx();
        paired_rpcs(&mut ctx, &[(0.0, 0, 500), (1.0, 500, 500)], &[(2.0, 0), (3.0, 500)]);
        ctx.finish_ingest();

        let dir = tempfile::tempdir().unwrap();
        NetAnalyzer::new().write_data(&ctx, dir.path()).unwrap();
        let delay = std::fs::read_to_string(dir.path().join("net_delay_node1.dat")).unwrap();
        assert!(delay.contains("# Node: node1"));
        assert!(delay.contains("Time4"));
        assert!(delay.contains("Delay4"));
        let backlog = std::fs::read_to_string(dir.path().join("net_backlog_node1.dat")).unwrap();
        assert!(backlog.contains("# Node: node1"));
        assert!(backlog.contains("Back4"));
    }
}
