//! Lifecycle timelines: how long RPCs take to reach each interesting stage
//! on clients and servers. Most useful for benchmarks where all RPCs have
//! the same size.

use std::io::Write;

use anyhow::Result;

use crate::analyzers::Analyzer;
use crate::core::context::RunContext;
use crate::core::rpc::RpcRecord;
use crate::core::types::is_client;
use crate::stats;

/// One lifecycle stage: a label plus the rule that picks the stage's
/// representative timestamp out of an RPC record. The first phase of each
/// table defines the RPC's start time.
struct Phase {
    label: &'static str,
    extract: fn(&RpcRecord) -> Option<f64>,
}

static CLIENT_PHASES: &[Phase] = &[
    Phase {
        label: "start",
        extract: |r: &RpcRecord| r.sendmsg,
    },
    Phase {
        label: "first request packet sent",
        extract: |r: &RpcRecord| r.send_data.first().map(|p| p.time),
    },
    Phase {
        label: "softirq gets first grant",
        extract: |r: &RpcRecord| r.softirq_grant.first().map(|p| p.time),
    },
    Phase {
        label: "last request packet sent",
        extract: |r: &RpcRecord| r.send_data.last().map(|p| p.time),
    },
    Phase {
        label: "gro gets first response packet",
        extract: |r: &RpcRecord| r.gro_data.first().map(|p| p.time),
    },
    Phase {
        label: "sent grant",
        extract: |r: &RpcRecord| r.send_grant.first().map(|g| g.time),
    },
    Phase {
        label: "gro gets last response packet",
        extract: |r: &RpcRecord| r.gro_data.last().map(|p| p.time),
    },
    Phase {
        label: "homa_recvmsg returning",
        extract: |r: &RpcRecord| r.recvmsg_done,
    },
];

static CLIENT_EXTRA: &[Phase] = &[
    Phase {
        label: "start",
        extract: |r: &RpcRecord| r.sendmsg,
    },
    Phase {
        label: "finished copying req into pkts",
        extract: |r: &RpcRecord| r.copy_in_done,
    },
    Phase {
        label: "started copying to user space",
        extract: |r: &RpcRecord| r.copy_out_start,
    },
    Phase {
        label: "finished copying to user space",
        extract: |r: &RpcRecord| r.copy_out_done,
    },
];

static SERVER_PHASES: &[Phase] = &[
    Phase {
        label: "start",
        extract: |r: &RpcRecord| r.gro_data.first().map(|p| p.time),
    },
    Phase {
        label: "sent grant",
        extract: |r: &RpcRecord| r.send_grant.first().map(|g| g.time),
    },
    Phase {
        label: "gro gets last request packet",
        extract: |r: &RpcRecord| r.gro_data.last().map(|p| p.time),
    },
    Phase {
        label: "homa_recvmsg returning",
        extract: |r: &RpcRecord| r.recvmsg_done,
    },
    Phase {
        label: "homa_sendmsg response",
        extract: |r: &RpcRecord| r.sendmsg,
    },
    Phase {
        label: "first response packet sent",
        extract: |r: &RpcRecord| r.send_data.first().map(|p| p.time),
    },
    Phase {
        label: "softirq gets first grant",
        extract: |r: &RpcRecord| r.softirq_grant.first().map(|p| p.time),
    },
    Phase {
        label: "last response packet sent",
        extract: |r: &RpcRecord| r.send_data.last().map(|p| p.time),
    },
];

static SERVER_EXTRA: &[Phase] = &[
    Phase {
        label: "start",
        extract: |r: &RpcRecord| r.gro_data.first().map(|p| p.time),
    },
    Phase {
        label: "started copying to user space",
        extract: |r: &RpcRecord| r.copy_out_start,
    },
    Phase {
        label: "finished copying to user space",
        extract: |r: &RpcRecord| r.copy_out_done,
    },
    Phase {
        label: "finished copying req into pkts",
        extract: |r: &RpcRecord| r.copy_in_done,
    },
];

/// Client RPCs must have both endpoints of their lifetime in the trace.
fn client_complete(rpc: &RpcRecord) -> bool {
    rpc.sendmsg.is_some() && rpc.recvmsg_done.is_some()
}

/// Server RPCs must have seen the request from its first byte and sent at
/// least one response packet.
fn server_complete(rpc: &RpcRecord) -> bool {
    rpc.gro_data.first().map(|p| p.offset) == Some(0) && !rpc.send_data.is_empty()
}

/// Fold one RPC's phase timestamps into the per-phase accumulators:
/// elapsed time since the RPC's start and delta since the previous
/// observed phase.
fn collect_phases(
    phases: &[Phase],
    rpc: &RpcRecord,
    totals: &mut [Vec<f64>],
    deltas: &mut [Vec<f64>],
) {
    let mut start = 0.0;
    let mut prev = 0.0;
    let mut have_start = false;
    for (i, phase) in phases.iter().enumerate() {
        let t = match (phase.extract)(rpc) {
            Some(t) => t,
            None => continue,
        };
        if i == 0 {
            start = t;
            prev = t;
            have_start = true;
        }
        if !have_start {
            continue;
        }
        totals[i].push(t - start);
        deltas[i].push(t - prev);
        prev = t;
    }
}

fn write_phases(
    w: &mut dyn Write,
    phases: &[Phase],
    totals: &[Vec<f64>],
    deltas: &[Vec<f64>],
) -> Result<()> {
    for i in 1..phases.len() {
        if totals[i].is_empty() {
            writeln!(w, "{:<32} (no events)", phases[i].label)?;
            continue;
        }
        let mut elapsed = totals[i].clone();
        elapsed.sort_by(|a, b| a.total_cmp(b));
        let mut gaps = deltas[i].clone();
        gaps.sort_by(|a, b| a.total_cmp(b));
        let avg_elapsed = elapsed.iter().sum::<f64>() / elapsed.len() as f64;
        let avg_gap = gaps.iter().sum::<f64>() / gaps.len() as f64;
        writeln!(
            w,
            "{:<32} Avg {:>7.1} us (+{:>7.1} us)  P90 {:>7.1} us (+{:>7.1} us)",
            phases[i].label,
            avg_elapsed,
            avg_gap,
            stats::percentile(&elapsed, 90),
            stats::percentile(&gaps, 90)
        )?;
    }
    Ok(())
}

pub struct TimelineAnalyzer;

impl TimelineAnalyzer {
    pub fn new() -> TimelineAnalyzer {
        TimelineAnalyzer
    }
}

impl Default for TimelineAnalyzer {
    fn default() -> TimelineAnalyzer {
        TimelineAnalyzer::new()
    }
}

impl Analyzer for TimelineAnalyzer {
    fn name(&self) -> &'static str {
        "timeline"
    }

    fn description(&self) -> &'static str {
        "Prints a timeline of how long RPCs take to reach interesting stages"
    }

    fn needs_rpcs(&self) -> bool {
        true
    }

    fn write(&self, ctx: &RunContext, w: &mut dyn Write) -> Result<()> {
        let mut num_client_rpcs = 0;
        let mut num_server_rpcs = 0;
        let mut client_totals = vec![Vec::new(); CLIENT_PHASES.len()];
        let mut client_deltas = vec![Vec::new(); CLIENT_PHASES.len()];
        let mut client_extra_totals = vec![Vec::new(); CLIENT_EXTRA.len()];
        let mut client_extra_deltas = vec![Vec::new(); CLIENT_EXTRA.len()];
        let mut server_totals = vec![Vec::new(); SERVER_PHASES.len()];
        let mut server_deltas = vec![Vec::new(); SERVER_PHASES.len()];
        let mut server_extra_totals = vec![Vec::new(); SERVER_EXTRA.len()];
        let mut server_extra_deltas = vec![Vec::new(); SERVER_EXTRA.len()];

        for (&id, rpc) in &ctx.rpcs {
            if is_client(id) {
                if !client_complete(rpc) {
                    continue;
                }
                num_client_rpcs += 1;
                collect_phases(CLIENT_PHASES, rpc, &mut client_totals, &mut client_deltas);
                collect_phases(
                    CLIENT_EXTRA,
                    rpc,
                    &mut client_extra_totals,
                    &mut client_extra_deltas,
                );
            } else {
                if !server_complete(rpc) {
                    continue;
                }
                num_server_rpcs += 1;
                collect_phases(SERVER_PHASES, rpc, &mut server_totals, &mut server_deltas);
                collect_phases(
                    SERVER_EXTRA,
                    rpc,
                    &mut server_extra_totals,
                    &mut server_extra_deltas,
                );
            }
        }

        writeln!(w)?;
        writeln!(w, "------------------")?;
        writeln!(w, "Analyzer: timeline")?;
        writeln!(w, "------------------")?;
        if num_client_rpcs > 0 {
            writeln!(w)?;
            writeln!(w, "Timeline for clients ({} RPCs):", num_client_rpcs)?;
            writeln!(w)?;
            write_phases(w, CLIENT_PHASES, &client_totals, &client_deltas)?;
            writeln!(w)?;
            write_phases(w, CLIENT_EXTRA, &client_extra_totals, &client_extra_deltas)?;
        }
        if num_server_rpcs > 0 {
            writeln!(w)?;
            writeln!(w, "Timeline for servers ({} RPCs):", num_server_rpcs)?;
            writeln!(w)?;
            write_phases(w, SERVER_PHASES, &server_totals, &server_deltas)?;
            writeln!(w)?;
            write_phases(w, SERVER_EXTRA, &server_extra_totals, &server_extra_deltas)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::core::context::Options;
    use crate::core::rpc::{PktSample, SentGrant, SentPacket};
    use crate::core::types::Trace;

    fn complete_client() -> RpcRecord {
        let mut rpc = RpcRecord::new("node1");
        rpc.sendmsg = Some(0.0);
        rpc.copy_in_done = Some(0.5);
        rpc.send_data.push(SentPacket {
            time: 1.0,
            offset: 0,
            length: 500,
        });
        rpc.send_data.push(SentPacket {
            time: 2.0,
            offset: 500,
            length: 500,
        });
        rpc.softirq_grant.push(PktSample {
            time: 1.5,
            offset: 1000,
        });
        rpc.gro_data.push(PktSample {
            time: 5.0,
            offset: 0,
        });
        rpc.gro_data.push(PktSample {
            time: 6.0,
            offset: 500,
        });
        rpc.send_grant.push(SentGrant {
            time: 5.5,
            offset: 1000,
            priority: 2,
        });
        rpc.copy_out_start = Some(6.5);
        rpc.copy_out_done = Some(7.5);
        rpc.recvmsg_done = Some(8.0);
        rpc
    }

    fn ctx_with(rpcs: Vec<(u64, RpcRecord)>) -> RunContext {
        let mut ctx = RunContext::new(Options::default());
        ctx.traces.insert(
            "node1".to_string(),
            Trace::new("node1".to_string(), Path::new("node1")),
        );
        for (id, rpc) in rpcs {
            ctx.rpcs.insert(id, rpc);
        }
        ctx.finish_ingest();
        ctx
    }

    fn report(ctx: &RunContext) -> String {
        let mut out = Vec::new();
        TimelineAnalyzer::new().write(ctx, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn complete_client_is_counted() {
        let ctx = ctx_with(vec![(100, complete_client())]);
        let text = report(&ctx);
        assert!(text.contains("Timeline for clients (1 RPCs):"));
        assert!(text.contains("homa_recvmsg returning"));
        // All client phases are observable in this fixture.
        assert!(!text.contains("(no events)"));
    }

    #[test]
    fn incomplete_client_is_excluded_entirely() {
        let mut rpc = complete_client();
        rpc.recvmsg_done = None;
        let ctx = ctx_with(vec![(100, rpc)]);
        let text = report(&ctx);
        assert!(!text.contains("Timeline for clients"));
    }

    #[test]
    fn server_requires_first_byte_and_a_send() {
        let mut rpc = RpcRecord::new("node1");
        // Request was already in flight when the trace began.
        rpc.gro_data.push(PktSample {
            time: 1.0,
            offset: 2800,
        });
        rpc.send_data.push(SentPacket {
            time: 4.0,
            offset: 0,
            length: 500,
        });
        let ctx = ctx_with(vec![(101, rpc)]);
        let text = report(&ctx);
        assert!(!text.contains("Timeline for servers"));
    }

    #[test]
    fn phase_deltas_accumulate() {
        let rpc = complete_client();
        let mut totals = vec![Vec::new(); CLIENT_PHASES.len()];
        let mut deltas = vec![Vec::new(); CLIENT_PHASES.len()];
        collect_phases(CLIENT_PHASES, &rpc, &mut totals, &mut deltas);
        // "homa_recvmsg returning" is 8.0 us from start, 2.0 us after the
        // last response packet arrived at GRO.
        assert_eq!(totals[7], vec![8.0]);
        assert_eq!(deltas[7], vec![2.0]);
        // "first request packet sent" is 1.0 us after sendmsg.
        assert_eq!(totals[1], vec![1.0]);
        assert_eq!(deltas[1], vec![1.0]);
    }

    #[test]
    fn missing_phase_reports_no_events() {
        let mut rpc = complete_client();
        rpc.softirq_grant.clear();
        let ctx = ctx_with(vec![(100, rpc)]);
        let text = report(&ctx);
        assert!(text.contains("softirq gets first grant"));
        assert!(text.contains("(no events)"));
    }
}
