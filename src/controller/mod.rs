pub mod finish;
pub mod step;
pub mod step_into;
pub mod step_over;
pub mod until;

pub use finish::{FinishPhysicalFrameThreadController, FinishThreadController};
pub use step::{StepMode, StepThreadController};
pub use step_into::StepIntoThreadController;
pub use step_over::StepOverThreadController;
pub use until::UntilThreadController;

use crate::address::AddressRange;
use crate::breakpoint::BreakpointRegistry;
use crate::error::Error;
use crate::session::{AgentReply, DebugSession, StopNotification};
use crate::stack::Stack;

/// How to resume the debugged thread. Queried fresh before every resume.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ContinueOp {
    Continue,
    StepInstruction,
    StepInRange(AddressRange),
    /// No agent interaction: the thread stays stopped and a stop notification
    /// is synthesized locally.
    SyntheticStop,
}

/// Controller's verdict on one stop notification.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StopOp {
    /// Resume the thread (defer to other voters).
    Continue,
    /// Report a user-visible stop; the controller is finished.
    StopDone,
    /// Neutral: this stop is not the controller's business.
    Unexpected,
}

/// Result of routing one stop notification into a controller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OnStop {
    Op(StopOp),
    /// Decision deferred until an outstanding agent request completes; the
    /// thread stays suspended meanwhile.
    Waiting,
}

/// Result of [`ThreadController::init`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InitOp {
    Ready,
    /// An asynchronous prerequisite is in flight; the matching reply finishes
    /// initialization.
    Waiting,
}

/// Result of routing one agent reply into a controller.
#[derive(Debug)]
pub enum OnReply {
    /// The reply is not addressed to this controller (late completion for a
    /// superseded operation, or somebody else's request).
    Unclaimed,
    /// Claimed; still waiting for more.
    Waiting,
    /// Initialization finished; the thread may resume.
    Ready,
    /// Initialization failed; the stepping operation is aborted and the
    /// thread stays stopped.
    Failed(Error),
    /// A previously deferred stop decision is now resolved.
    Decided(StopOp),
}

/// Everything a controller may touch while making decisions: the thread's
/// stack (metadata-only mutation), the collaborator session, and the
/// in-flight breakpoint registration arena.
pub struct StepContext<'a> {
    pub stack: &'a mut Stack,
    pub session: &'a mut dyn DebugSession,
    pub breakpoints: &'a mut BreakpointRegistry,
}

/// One stepping strategy for a thread.
///
/// A controller never resumes the thread itself: the owning thread queries
/// [`continue_op`](ThreadController::continue_op) before every resume and
/// routes every stop notification and agent reply into the active controller.
/// Completion is signaled by returning [`StopOp::StopDone`]; the owner then
/// calls [`teardown`](ThreadController::teardown) and discards the
/// controller, so nothing references its state afterwards. `teardown` must be
/// idempotent and must tolerate requests still in flight.
pub trait ThreadController {
    fn name(&self) -> &'static str;

    fn init(&mut self, ctx: &mut StepContext) -> Result<InitOp, Error>;

    /// Must not mutate protocol state, only local bookkeeping.
    fn continue_op(&mut self, ctx: &mut StepContext) -> ContinueOp;

    fn on_stop(&mut self, stop: &StopNotification, ctx: &mut StepContext) -> OnStop;

    fn on_reply(&mut self, reply: &AgentReply, ctx: &mut StepContext) -> OnReply;

    fn teardown(&mut self, ctx: &mut StepContext);
}

/// Re-express a stop verdict as a reply outcome (used when a deferred stop
/// decision resolves inside `on_reply`).
pub(crate) fn stop_to_reply(outcome: OnStop) -> OnReply {
    match outcome {
        OnStop::Op(op) => OnReply::Decided(op),
        OnStop::Waiting => OnReply::Waiting,
    }
}
