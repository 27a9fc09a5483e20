use crate::address::{AddressRange, RelocatedAddress};
use crate::controller::ContinueOp;
use crate::stack::{FileLine, Frame};
use smallvec::SmallVec;

/// Identifier of one in-flight request to the remote agent. Ids are issued by
/// the session, are unique for its lifetime and never reused, so a stale id
/// held by a torn-down controller can never be confused with a live one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RequestId(pub u64);

/// Identifier of a breakpoint registered at the remote agent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BreakpointId(pub u32);

/// Line table information covering one address.
#[derive(Clone, Debug)]
pub struct LineInfo {
    pub file_line: FileLine,
    /// Code range of the line table entry that covers the queried address.
    pub range: AddressRange,
}

/// Why the debugged thread stopped. All variants except [`StopType::Synthetic`]
/// are produced by the remote agent; `Synthetic` is generated locally for
/// inline-frame transitions and never crosses the wire.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum_macros::Display)]
pub enum StopType {
    SingleStep,
    Hardware,
    Software,
    Exception,
    Synthetic,
}

pub type HitBreakpoints = SmallVec<[BreakpointId; 2]>;

/// One execution-stop notification delivered by the remote agent.
#[derive(Clone, Debug)]
pub struct StopNotification {
    pub stop_type: StopType,
    pub hit_breakpoints: HitBreakpoints,
    /// Innermost frames captured by the agent at stop time; possibly partial.
    pub frames: Vec<Frame>,
    pub frames_complete: bool,
}

/// Completion of an asynchronous agent request, routed into the controller
/// chain. Synced frames themselves are applied to the thread's stack before
/// routing, so the payload carries only the success/failure of the sync.
#[derive(Debug)]
pub struct AgentReply {
    pub request: RequestId,
    pub payload: ReplyPayload,
}

#[derive(Debug)]
pub enum ReplyPayload {
    FramesSynced(Result<(), anyhow::Error>),
    BreakpointAdded(Result<BreakpointId, anyhow::Error>),
    BreakpointRemoved(Result<(), anyhow::Error>),
}

/// Collaborators of the stepping engine: symbol/line resolution plus the
/// asynchronous agent RPCs.
///
/// Async methods issue a request and return its id immediately; the completion
/// must later be delivered through the matching `Thread::on_*` entry point.
/// The transport is assumed to deliver commands in FIFO order without waiting
/// for replies, so a breakpoint add issued right before a resume is installed
/// remotely before the resume is processed.
pub trait DebugSession {
    /// Line table entry covering `address`, `None` if the address has no line
    /// information at all.
    fn line_info(&self, address: RelocatedAddress) -> Option<LineInfo>;

    /// Whether `address` belongs to a module known to carry debug symbols.
    fn module_has_symbols(&self, address: RelocatedAddress) -> bool;

    /// Request a full stack sync for the thread.
    fn sync_frames(&mut self) -> RequestId;

    /// Register a remote breakpoint. `sp_gate` asks the agent to report hits
    /// only at or above the given stack pointer; the local gate check remains
    /// authoritative.
    fn add_breakpoint(
        &mut self,
        address: RelocatedAddress,
        sp_gate: Option<RelocatedAddress>,
    ) -> RequestId;

    fn remove_breakpoint(&mut self, id: BreakpointId) -> RequestId;

    /// Resume the debugged thread. Fire-and-forget: the completion only
    /// signals transport acceptance, not execution progress.
    fn resume(&mut self, op: ContinueOp);
}
