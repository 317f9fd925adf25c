//! Run-scoped state: the RPC table, the traces that have been read, the
//! options the analyzers consult, and values derived from the full table
//! once ingestion is complete.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::core::rpc::RpcRecord;
use crate::core::types::{RpcId, Trace};

/// Message data carried by a full-size packet when no multi-packet RPC is
/// available to infer the real size from. Large enough that it never splits
/// a message into phantom extra packets.
const FALLBACK_PACKET_SIZE: u64 = 100_000;

/// Analyzer-facing configuration for one run.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Suppress warnings about negative end-to-end delays.
    pub negative_ok: bool,
    /// Print per-event diagnostic detail.
    pub verbose: bool,
    /// Directory for auxiliary data files; none means no files are written.
    pub data_dir: Option<PathBuf>,
}

/// All state accumulated by one analysis run. Built up by the dispatcher
/// and the RPC ingest handler while trace files are parsed; finalized with
/// `finish_ingest` before any analyzer computes statistics.
pub struct RunContext {
    /// Every trace read so far, by node name.
    pub traces: BTreeMap<String, Trace>,
    /// Every RPC observed in any trace, by id. Records are never removed.
    pub rpcs: BTreeMap<RpcId, RpcRecord>,
    pub options: Options,
    packet_size: Option<u64>,
    sorted_nodes: Vec<String>,
}

impl RunContext {
    pub fn new(options: Options) -> RunContext {
        RunContext {
            traces: BTreeMap::new(),
            rpcs: BTreeMap::new(),
            options,
            packet_size: None,
            sorted_nodes: Vec::new(),
        }
    }

    /// Compute the values derived from the complete table. Must be called
    /// after the last file has been parsed and before analyzers run; the
    /// cross-file correlation analyzers depend on every trace being
    /// present.
    pub fn finish_ingest(&mut self) {
        self.packet_size = Some(infer_packet_size(&self.rpcs));
        self.sorted_nodes = sort_nodes(&self.traces);
    }

    /// The amount of message data in a full-size packet as seen by a
    /// receiver. Senders may emit larger GSO packets.
    pub fn packet_size(&self) -> u64 {
        self.packet_size.unwrap_or(FALLBACK_PACKET_SIZE)
    }

    /// Node names in report order: by embedded number when every name has
    /// one, otherwise alphabetically.
    pub fn sorted_nodes(&self) -> &[String] {
        &self.sorted_nodes
    }
}

/// First integer appearing in `s`, if any.
fn extract_num(s: &str) -> Option<u64> {
    let digits: String = s
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn sort_nodes(traces: &BTreeMap<String, Trace>) -> Vec<String> {
    let mut nodes: Vec<String> = traces.keys().cloned().collect();
    if nodes.iter().all(|n| extract_num(n).is_some()) {
        nodes.sort_by_key(|n| extract_num(n).unwrap());
    } else {
        nodes.sort();
    }
    nodes
}

/// Infer the receiver-side packet size from SoftIRQ offset gaps: use the
/// first RPC whose gaps repeat (the repeated gap is the packet size; a
/// non-repeating gap can be unscheduled data), otherwise fall back to the
/// gap after offset zero, and finally to a large constant when no
/// multi-packet RPC exists (in which case the size does not matter).
fn infer_packet_size(rpcs: &BTreeMap<RpcId, RpcRecord>) -> u64 {
    let mut fallback = None;
    for rpc in rpcs.values() {
        if rpc.softirq_data.is_empty() || rpc.recvmsg_done.is_none() {
            continue;
        }
        let mut offsets: Vec<u64> = rpc.softirq_data.iter().map(|p| p.offset).collect();
        offsets.sort_unstable();
        if offsets.len() < 2 || offsets[0] != 0 {
            continue;
        }
        let first_gap = offsets[1] - offsets[0];
        if offsets.len() >= 4 {
            let mut second = None;
            for pair in offsets.windows(2).skip(1) {
                let gap = pair[1] - pair[0];
                if gap == first_gap || Some(gap) == second {
                    return gap;
                }
                second = Some(gap);
            }
        }
        fallback = Some(first_gap);
    }
    fallback.unwrap_or(FALLBACK_PACKET_SIZE)
}
