//! The pattern dispatch engine: turns raw trace lines into typed events and
//! fans them out to the analyzers that registered an interest.
//!
//! Every line is parsed in two phases. First the envelope that is common to
//! all records (timestamp, core number, message text); lines without a valid
//! envelope are non-trace noise and are skipped. Then the message text is
//! matched against the shape table, in table order, and the first matching
//! shape produces the line's single event.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use log::info;
use regex::{Captures, Regex};
use thiserror::Error;

use crate::analyzers::Analyzer;
use crate::core::context::RunContext;
use crate::core::rpc::RpcIngest;
use crate::core::types::{Event, EventKind, Trace};

/// Errors in how a run was configured. These are fatal and reported before
/// any parsing starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no analyzer named \"{0}\"")]
    UnknownAnalyzer(String),
    #[error("analyzer {analyzer} registered interest in unknown shape \"{shape}\"")]
    UnknownShape {
        analyzer: &'static str,
        shape: String,
    },
}

/// One line shape: a name analyzers subscribe to, the pattern matched
/// against the message portion of a record, and the extraction rule that
/// builds the typed event from the match.
pub struct ShapeDef {
    pub name: &'static str,
    pattern: &'static str,
    extract: fn(&Captures) -> Option<EventKind>,
}

fn num(caps: &Captures, i: usize) -> Option<u64> {
    caps.get(i)?.as_str().parse().ok()
}

fn num32(caps: &Captures, i: usize) -> Option<u32> {
    caps.get(i)?.as_str().parse().ok()
}

fn text(caps: &Captures, i: usize) -> Option<String> {
    Some(caps.get(i)?.as_str().to_string())
}

fn gro_data(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::GroData {
        peer: text(caps, 1)?,
        id: num(caps, 2)?,
        offset: num(caps, 3)?,
    })
}

fn gro_grant(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::GroGrant {
        peer: text(caps, 1)?,
        id: num(caps, 2)?,
        offset: num(caps, 3)?,
        priority: num32(caps, 4)?,
    })
}

fn softirq_data(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::SoftirqData {
        id: num(caps, 1)?,
        offset: num(caps, 2)?,
        length: num(caps, 3)?,
    })
}

fn softirq_grant(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::SoftirqGrant {
        id: num(caps, 1)?,
        offset: num(caps, 2)?,
    })
}

fn ip_xmit(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::IpXmit {
        id: num(caps, 1)?,
        offset: num(caps, 2)?,
    })
}

fn send_data(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::SendData {
        id: num(caps, 1)?,
        offset: num(caps, 2)?,
        length: num(caps, 3)?,
    })
}

fn send_grant(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::SendGrant {
        id: num(caps, 1)?,
        offset: num(caps, 2)?,
        priority: num32(caps, 3)?,
    })
}

fn sendmsg_request(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::SendmsgRequest {
        peer: text(caps, 1)?,
        id: num(caps, 2)?,
        length: num(caps, 3)?,
    })
}

fn sendmsg_response(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::SendmsgResponse {
        id: num(caps, 1)?,
        length: num(caps, 2)?,
    })
}

fn recvmsg_done(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::RecvmsgDone {
        id: num(caps, 1)?,
        length: num(caps, 2)?,
    })
}

fn copy_in_start(_caps: &Captures) -> Option<EventKind> {
    Some(EventKind::CopyInStart)
}

fn copy_in_done(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::CopyInDone {
        id: num(caps, 1)?,
        bytes: num(caps, 2)?,
    })
}

fn copy_out_start(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::CopyOutStart { id: num(caps, 1)? })
}

fn copy_out_done(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::CopyOutDone {
        bytes: num(caps, 1)?,
        id: num(caps, 2)?,
    })
}

fn free_skbs(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::FreeSkbs {
        count: num(caps, 1)?,
    })
}

fn resend(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::Resend {
        id: num(caps, 1)?,
        offset: num(caps, 2)?,
    })
}

fn retransmit(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::Retransmit {
        offset: num(caps, 1)?,
        length: num(caps, 2)?,
        id: num(caps, 3)?,
    })
}

/// The shape table. Order is matching priority: the patterns most likely to
/// match are at the front so that hot lines are classified with as few
/// regex attempts as possible.
pub static SHAPES: &[ShapeDef] = &[
    ShapeDef {
        name: "gro_data",
        pattern: r"^homa_gro_receive got packet from ([^ ]+) id ([0-9]+), offset ([0-9.]+)",
        extract: gro_data,
    },
    ShapeDef {
        name: "gro_grant",
        pattern: r"^homa_gro_receive got grant from ([^ ]+) id ([0-9]+), offset ([0-9]+), priority ([0-9]+)",
        extract: gro_grant,
    },
    ShapeDef {
        name: "softirq_data",
        pattern: r"^incoming data packet, id ([0-9]+), .*, offset ([0-9.]+)/([0-9.]+)",
        extract: softirq_data,
    },
    ShapeDef {
        name: "softirq_grant",
        pattern: r"^processing grant for id ([0-9]+), offset ([0-9]+)",
        extract: softirq_grant,
    },
    ShapeDef {
        name: "ip_xmit",
        pattern: r"^calling ip.*_xmit: .* id ([0-9]+), offset ([0-9]+)",
        extract: ip_xmit,
    },
    ShapeDef {
        name: "send_data",
        pattern: r"^Finished queueing packet: rpc id ([0-9]+), offset ([0-9]+), len ([0-9]+)",
        extract: send_data,
    },
    ShapeDef {
        name: "send_grant",
        pattern: r"^sending grant for id ([0-9]+), offset ([0-9]+), priority ([0-9]+)",
        extract: send_grant,
    },
    ShapeDef {
        name: "sendmsg_request",
        pattern: r"^homa_sendmsg request, target ([^: ]+):.* id ([0-9]+), length ([0-9]+)",
        extract: sendmsg_request,
    },
    ShapeDef {
        name: "sendmsg_response",
        pattern: r"^homa_sendmsg response, id ([0-9]+), .*length ([0-9]+)",
        extract: sendmsg_response,
    },
    ShapeDef {
        name: "recvmsg_done",
        pattern: r"^homa_recvmsg returning id ([0-9]+), length ([0-9]+)",
        extract: recvmsg_done,
    },
    ShapeDef {
        name: "copy_in_start",
        pattern: r"^starting copy from user space",
        extract: copy_in_start,
    },
    ShapeDef {
        name: "copy_in_done",
        pattern: r"^finished copy from user space for id ([-0-9.]+), length ([-0-9.]+)",
        extract: copy_in_done,
    },
    ShapeDef {
        name: "copy_out_start",
        pattern: r"^starting copy to user space for id ([0-9]+)",
        extract: copy_out_start,
    },
    ShapeDef {
        name: "copy_out_done",
        pattern: r"^finished copying ([-0-9.]+) bytes for id ([-0-9.]+)",
        extract: copy_out_done,
    },
    ShapeDef {
        name: "free_skbs",
        pattern: r"^finished freeing ([0-9]+) skbs",
        extract: free_skbs,
    },
    ShapeDef {
        name: "resend",
        pattern: r"^Sent RESEND for client RPC id ([0-9]+), .* offset ([0-9]+)",
        extract: resend,
    },
    ShapeDef {
        name: "retransmit",
        pattern: r"^retransmitting offset ([0-9]+), length ([0-9]+), id ([0-9]+)",
        extract: retransmit,
    },
];

lazy_static! {
    static ref ENVELOPE: Regex = Regex::new(r"^ *([-0-9.]+) us .* \[C([0-9]+)\] (.*)").unwrap();
    static ref SHAPE_REGEX: Vec<Regex> = SHAPES
        .iter()
        .map(|s| Regex::new(s.pattern).unwrap())
        .collect();
}

/// A shape with at least one subscriber, plus the analyzers to notify.
struct ActiveShape {
    shape: usize,
    subscribers: Vec<usize>,
}

/// Owns the registered analyzers and drives parsing: reads trace files,
/// matches lines against the shapes analyzers subscribed to, and invokes
/// subscribers synchronously in registration order.
pub struct Dispatcher {
    analyzers: Vec<Box<dyn Analyzer>>,
    names: HashMap<&'static str, usize>,
    interests: HashMap<&'static str, Vec<usize>>,
    active: Vec<ActiveShape>,
    stale: bool,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher {
            analyzers: Vec::new(),
            names: HashMap::new(),
            interests: HashMap::new(),
            active: Vec::new(),
            stale: false,
        }
    }

    /// Register an analyzer. Registering the same analyzer name twice is a
    /// no-op; an interest in a shape the table doesn't know is a fatal
    /// configuration error. Analyzers that consume RPC records pull in the
    /// `rpc` ingest handler first so that records are up to date before any
    /// dependent analyzer sees an event.
    pub fn register(&mut self, analyzer: Box<dyn Analyzer>) -> Result<(), ConfigError> {
        if self.names.contains_key(analyzer.name()) {
            return Ok(());
        }
        if analyzer.needs_rpcs() && !self.names.contains_key("rpc") {
            self.register(Box::new(RpcIngest::new()))?;
        }
        for shape in analyzer.interests() {
            if !SHAPES.iter().any(|s| s.name == *shape) {
                return Err(ConfigError::UnknownShape {
                    analyzer: analyzer.name(),
                    shape: shape.to_string(),
                });
            }
        }
        let ix = self.analyzers.len();
        self.names.insert(analyzer.name(), ix);
        for shape in analyzer.interests() {
            self.interests.entry(*shape).or_default().push(ix);
        }
        self.analyzers.push(analyzer);
        self.stale = true;
        Ok(())
    }

    /// Parse one trace file, updating the run context and notifying
    /// subscribers line by line.
    pub fn parse_file(&mut self, ctx: &mut RunContext, path: &Path) -> Result<()> {
        let file = File::open(path)
            .with_context(|| format!("failed to open trace file {}", path.display()))?;
        let name = match path.file_stem() {
            Some(stem) => stem.to_string_lossy().into_owned(),
            None => path.display().to_string(),
        };
        info!("reading trace file {}", path.display());
        self.parse_lines(ctx, name, path, BufReader::new(file))
    }

    fn parse_lines<R: BufRead>(
        &mut self,
        ctx: &mut RunContext,
        name: String,
        path: &Path,
        reader: R,
    ) -> Result<()> {
        self.build_active();
        let mut trace = Trace::new(name.clone(), path);
        let Dispatcher {
            active, analyzers, ..
        } = self;
        for line in reader.lines() {
            let line = line?;
            let caps = match ENVELOPE.captures(&line) {
                Some(caps) => caps,
                None => continue,
            };
            let time: f64 = match caps[1].parse() {
                Ok(t) => t,
                Err(_) => continue,
            };
            let core: u32 = match caps[2].parse() {
                Ok(c) => c,
                Err(_) => continue,
            };
            let msg = caps.get(3).map(|m| m.as_str()).unwrap_or("");
            trace.observe(time);

            for entry in active.iter() {
                if let Some(caps) = SHAPE_REGEX[entry.shape].captures(msg) {
                    if let Some(kind) = (SHAPES[entry.shape].extract)(&caps) {
                        let event = Event { time, core, kind };
                        for &ix in &entry.subscribers {
                            analyzers[ix].record(ctx, &name, &event);
                        }
                    }
                    break;
                }
            }
        }
        ctx.traces.insert(name, trace);
        Ok(())
    }

    /// Rebuild the list of shapes worth attempting: those with at least one
    /// subscriber, in table order.
    fn build_active(&mut self) {
        if !self.stale {
            return;
        }
        self.active = SHAPES
            .iter()
            .enumerate()
            .filter_map(|(ix, shape)| {
                self.interests.get(shape.name).map(|subs| ActiveShape {
                    shape: ix,
                    subscribers: subs.clone(),
                })
            })
            .collect();
        self.stale = false;
    }

    /// Write each analyzer's report section, in registration order.
    pub fn write_reports(&self, ctx: &RunContext, w: &mut dyn Write) -> Result<()> {
        for analyzer in &self.analyzers {
            analyzer.write(ctx, w)?;
        }
        Ok(())
    }

    /// Give each analyzer a chance to emit auxiliary data files.
    pub fn write_data(&self, ctx: &RunContext, dir: &Path) -> Result<()> {
        for analyzer in &self.analyzers {
            analyzer.write_data(ctx, dir)?;
        }
        Ok(())
    }
}

impl Default for Dispatcher {
    fn default() -> Dispatcher {
        Dispatcher::new()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    use super::*;
    use crate::core::context::Options;

    /// Test double that appends every delivered event to a shared log.
    struct Recorder {
        shapes: &'static [&'static str],
        seen: Rc<RefCell<Vec<(String, Event)>>>,
    }

    impl Analyzer for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }
        fn description(&self) -> &'static str {
            "test recorder"
        }
        fn interests(&self) -> &'static [&'static str] {
            self.shapes
        }
        fn record(&mut self, _ctx: &mut RunContext, node: &str, event: &Event) {
            self.seen.borrow_mut().push((node.to_string(), event.clone()));
        }
        fn write(&self, _ctx: &RunContext, _w: &mut dyn Write) -> Result<()> {
            Ok(())
        }
    }

    fn parse(input: &str, shapes: &'static [&'static str]) -> (RunContext, Vec<(String, Event)>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register(Box::new(Recorder {
                shapes,
                seen: Rc::clone(&seen),
            }))
            .unwrap();
        let mut ctx = RunContext::new(Options::default());
        dispatcher
            .parse_lines(
                &mut ctx,
                "node1".to_string(),
                Path::new("node1.tt"),
                Cursor::new(input.to_string()),
            )
            .unwrap();
        let events = seen.borrow().clone();
        (ctx, events)
    }

    #[test]
    fn envelope_and_shape_extraction() {
        let input = "\
    316.951 us (+   0.008 us) [C06] homa_gro_receive got packet from 0xc0a80105 id 1234, offset 4200\n\
random noise without an envelope\n\
    400.000 us (+  83.049 us) [C02] homa_recvmsg returning id 1234, length 9000\n";
        let (ctx, events) = parse(input, &["gro_data", "recvmsg_done"]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "node1");
        assert_eq!(
            events[0].1,
            Event {
                time: 316.951,
                core: 6,
                kind: EventKind::GroData {
                    peer: "0xc0a80105".to_string(),
                    id: 1234,
                    offset: 4200,
                },
            }
        );
        assert_eq!(
            events[1].1.kind,
            EventKind::RecvmsgDone {
                id: 1234,
                length: 9000,
            }
        );
        let trace = &ctx.traces["node1"];
        assert_eq!(trace.first(), 316.951);
        assert_eq!(trace.last(), 400.0);
    }

    #[test]
    fn only_subscribed_shapes_are_delivered() {
        let input = "\
  1.000 us (+ 0.1 us) [C00] homa_gro_receive got packet from 0xabc id 8, offset 0\n\
  2.000 us (+ 1.0 us) [C00] sending grant for id 8, offset 10000, priority 3\n";
        let (_, events) = parse(input, &["send_grant"]);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].1.kind,
            EventKind::SendGrant {
                id: 8,
                offset: 10000,
                priority: 3,
            }
        );
    }

    #[test]
    fn events_arrive_in_file_order() {
        let input = "\
  5.0 us (+ 1.0 us) [C01] starting copy from user space\n\
  6.0 us (+ 1.0 us) [C01] finished copy from user space for id 42, length 800\n\
  7.0 us (+ 1.0 us) [C01] starting copy from user space\n";
        let (_, events) = parse(input, &["copy_in_start", "copy_in_done"]);
        let times: Vec<f64> = events.iter().map(|(_, e)| e.time).collect();
        assert_eq!(times, vec![5.0, 6.0, 7.0]);
    }

    #[test]
    fn unknown_shape_subscription_is_fatal() {
        let mut dispatcher = Dispatcher::new();
        let err = dispatcher
            .register(Box::new(Recorder {
                shapes: &["no_such_shape"],
                seen: Rc::new(RefCell::new(Vec::new())),
            }))
            .unwrap_err();
        assert!(err.to_string().contains("no_such_shape"));
    }

    #[test]
    fn all_patterns_compile() {
        assert_eq!(SHAPE_REGEX.len(), SHAPES.len());
    }

    #[test]
    fn retransmit_capture_order() {
        let input = "  9.0 us (+ 2.0 us) [C03] retransmitting offset 60000, length 1400, id 77\n";
        let (_, events) = parse(input, &["retransmit"]);
        assert_eq!(
            events[0].1.kind,
            EventKind::Retransmit {
                id: 77,
                offset: 60000,
                length: 1400,
            }
        );
    }
}
