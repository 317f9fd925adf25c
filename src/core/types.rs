/// Core types shared by the dispatch engine and the analyzers: Trace and Event.
use std::path::{Path, PathBuf};

/// Identifier for an RPC. Client-initiated RPCs have even ids; the server
/// side of the same exchange uses the same id with the low bit set.
pub type RpcId = u64;

/// Returns true if `id` names the client side of an RPC.
pub fn is_client(id: RpcId) -> bool {
    id & 1 == 0
}

/// The id of the RPC's counterpart on the other host.
pub fn counterpart(id: RpcId) -> RpcId {
    id ^ 1
}

/// One capture session from one host. Timestamps are microseconds as
/// recorded in the trace; the bounds are updated as lines are consumed and
/// may be absent for a file containing no parseable events.
#[derive(Debug, Clone)]
pub struct Trace {
    /// Host name: the trace file's stem, used to label all output.
    pub name: String,
    pub file: PathBuf,
    pub first_time: Option<f64>,
    pub last_time: Option<f64>,
}

impl Trace {
    pub fn new(name: String, file: &Path) -> Trace {
        Trace {
            name,
            file: file.to_path_buf(),
            first_time: None,
            last_time: None,
        }
    }

    /// Record that an event with this timestamp was read from the file.
    pub fn observe(&mut self, time: f64) {
        if self.first_time.is_none() {
            self.first_time = Some(time);
        }
        self.last_time = Some(time);
    }

    pub fn first(&self) -> f64 {
        self.first_time.unwrap_or(0.0)
    }

    pub fn last(&self) -> f64 {
        self.last_time.unwrap_or(0.0)
    }

    /// Total time interval covered by the trace.
    pub fn elapsed(&self) -> f64 {
        self.last() - self.first()
    }
}

/// A typed record produced from one trace line.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Time of the record, in microseconds.
    pub time: f64,
    /// Core on which the event occurred.
    pub core: u32,
    pub kind: EventKind,
}

/// One variant per line shape the dispatcher knows about. Offsets and
/// lengths are message byte positions/counts.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Incoming data packet seen by GRO.
    GroData { peer: String, id: RpcId, offset: u64 },
    /// Incoming grant packet seen by GRO.
    GroGrant {
        peer: String,
        id: RpcId,
        offset: u64,
        priority: u32,
    },
    /// Incoming data packet processed at SoftIRQ level; `length` is the
    /// total incoming message length declared by the packet.
    SoftirqData { id: RpcId, offset: u64, length: u64 },
    /// Incoming grant processed at SoftIRQ level.
    SoftirqGrant { id: RpcId, offset: u64 },
    /// ip*_xmit was invoked for an outgoing data packet.
    IpXmit { id: RpcId, offset: u64 },
    /// An outgoing data packet finished queueing.
    SendData { id: RpcId, offset: u64, length: u64 },
    /// An outgoing grant was sent.
    SendGrant { id: RpcId, offset: u64, priority: u32 },
    /// homa_sendmsg was invoked for a request message.
    SendmsgRequest { peer: String, id: RpcId, length: u64 },
    /// homa_sendmsg was invoked for a response message.
    SendmsgResponse { id: RpcId, length: u64 },
    /// The blocking receive call returned.
    RecvmsgDone { id: RpcId, length: u64 },
    /// A copy from user space started on this core.
    CopyInStart,
    /// A copy from user space finished.
    CopyInDone { id: RpcId, bytes: u64 },
    /// A copy to user space started.
    CopyOutStart { id: RpcId },
    /// A copy to user space finished.
    CopyOutDone { id: RpcId, bytes: u64 },
    /// Socket buffers were freed after a copy to user space.
    FreeSkbs { count: u64 },
    /// A RESEND request was issued for an offset.
    Resend { id: RpcId, offset: u64 },
    /// A packet was retransmitted.
    Retransmit { id: RpcId, offset: u64, length: u64 },
}

impl EventKind {
    /// The RPC this event refers to, when it refers to one.
    pub fn rpc_id(&self) -> Option<RpcId> {
        match *self {
            EventKind::GroData { id, .. }
            | EventKind::GroGrant { id, .. }
            | EventKind::SoftirqData { id, .. }
            | EventKind::SoftirqGrant { id, .. }
            | EventKind::IpXmit { id, .. }
            | EventKind::SendData { id, .. }
            | EventKind::SendGrant { id, .. }
            | EventKind::SendmsgRequest { id, .. }
            | EventKind::SendmsgResponse { id, .. }
            | EventKind::RecvmsgDone { id, .. }
            | EventKind::CopyInDone { id, .. }
            | EventKind::CopyOutStart { id }
            | EventKind::CopyOutDone { id, .. }
            | EventKind::Resend { id, .. }
            | EventKind::Retransmit { id, .. } => Some(id),
            EventKind::CopyInStart | EventKind::FreeSkbs { .. } => None,
        }
    }
}
