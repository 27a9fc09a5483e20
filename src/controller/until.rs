use crate::address::RelocatedAddress;
use crate::controller::{ContinueOp, InitOp, OnReply, OnStop, StepContext, StopOp, ThreadController};
use crate::error::Error;
use crate::fingerprint::FrameFingerprint;
use crate::session::{AgentReply, BreakpointId, ReplyPayload, RequestId, StopNotification};
use anyhow::anyhow;
use log::debug;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BreakpointState {
    NotRequested,
    Pending(RequestId),
    Armed(BreakpointId),
    Removed,
}

/// Primitive "run to a single address under a stack-depth gate" controller,
/// the building block of all frame-unwinding operations.
///
/// Registers exactly one remote breakpoint at init. A hit is accepted only if
/// the current frame's stack pointer is at or above the gate, which rejects a
/// recursive call revisiting the same address at a deeper stack depth. The
/// breakpoint is deregistered on acceptance or at teardown, whichever comes
/// first, and never twice.
pub struct UntilThreadController {
    target: RelocatedAddress,
    /// Stop only at or older than this frame.
    gate: Option<FrameFingerprint>,
    breakpoint: BreakpointState,
}

impl UntilThreadController {
    pub fn new(target: RelocatedAddress) -> Self {
        Self {
            target,
            gate: None,
            breakpoint: BreakpointState::NotRequested,
        }
    }

    pub fn with_gate(target: RelocatedAddress, gate: FrameFingerprint) -> Self {
        Self {
            target,
            gate: Some(gate),
            breakpoint: BreakpointState::NotRequested,
        }
    }

    fn gate_allows(&self, ctx: &StepContext) -> bool {
        match self.gate {
            None => true,
            Some(gate) => ctx.stack.top().sp >= gate.frame_address(),
        }
    }
}

impl ThreadController for UntilThreadController {
    fn name(&self) -> &'static str {
        "until"
    }

    fn init(&mut self, ctx: &mut StepContext) -> Result<InitOp, Error> {
        let gate_sp = self.gate.map(|g| g.frame_address());
        let request = ctx.session.add_breakpoint(self.target, gate_sp);
        ctx.breakpoints.watch(request);
        self.breakpoint = BreakpointState::Pending(request);
        debug!(target: "until", "breakpoint requested at {} (gate {gate_sp:?})", self.target);
        Ok(InitOp::Waiting)
    }

    fn continue_op(&mut self, _ctx: &mut StepContext) -> ContinueOp {
        ContinueOp::Continue
    }

    fn on_stop(&mut self, stop: &StopNotification, ctx: &mut StepContext) -> OnStop {
        let BreakpointState::Armed(id) = self.breakpoint else {
            return OnStop::Op(StopOp::Unexpected);
        };
        if !stop.hit_breakpoints.contains(&id) {
            return OnStop::Op(StopOp::Unexpected);
        }

        if self.gate_allows(ctx) {
            debug!(target: "until", "target {} reached, gate passed", self.target);
            let _ = ctx.session.remove_breakpoint(id);
            self.breakpoint = BreakpointState::Removed;
            OnStop::Op(StopOp::StopDone)
        } else {
            debug!(
                target: "until",
                "target {} revisited by a deeper (recursive) frame, continue", self.target
            );
            OnStop::Op(StopOp::Continue)
        }
    }

    fn on_reply(&mut self, reply: &AgentReply, _ctx: &mut StepContext) -> OnReply {
        let BreakpointState::Pending(request) = self.breakpoint else {
            return OnReply::Unclaimed;
        };
        if request != reply.request {
            return OnReply::Unclaimed;
        }

        match &reply.payload {
            ReplyPayload::BreakpointAdded(Ok(id)) => {
                debug!(target: "until", "breakpoint {id:?} armed at {}", self.target);
                self.breakpoint = BreakpointState::Armed(*id);
                OnReply::Ready
            }
            ReplyPayload::BreakpointAdded(Err(e)) => {
                self.breakpoint = BreakpointState::NotRequested;
                OnReply::Failed(Error::BreakpointAdd(anyhow!("{e:#}")))
            }
            _ => OnReply::Waiting,
        }
    }

    fn teardown(&mut self, ctx: &mut StepContext) {
        match self.breakpoint {
            BreakpointState::Pending(request) => {
                // registration round trip still in flight: leave cleanup to
                // the registry once the reply arrives
                ctx.breakpoints.orphan(request);
            }
            BreakpointState::Armed(id) => {
                let _ = ctx.session.remove_breakpoint(id);
            }
            BreakpointState::NotRequested | BreakpointState::Removed => {}
        }
        self.breakpoint = BreakpointState::Removed;
    }
}
