use crate::controller::step::StepThreadController;
use crate::controller::{
    ContinueOp, InitOp, OnReply, OnStop, StepContext, StopOp, ThreadController,
};
use crate::error::Error;
use crate::session::{AgentReply, StopNotification, StopType};
use log::debug;

/// Step that descends into calls, including inline ones.
///
/// If the thread sits at the entry of an inline function whose frame is
/// currently treated as not-yet-entered, "stepping in" is a pure bookkeeping
/// move: when the resume decision is first queried, the next hidden inline
/// frame is revealed and a synthetic stop is requested without executing a
/// single instruction. Otherwise this is plain range stepping, which
/// naturally lands in a callee on the first call instruction of the range.
pub struct StepIntoThreadController {
    stepper: StepThreadController,
    line_mode: bool,
    queried: bool,
    synthetic_pending: bool,
}

impl StepIntoThreadController {
    pub fn source_line() -> Self {
        Self {
            stepper: StepThreadController::source_line(),
            line_mode: true,
            queried: false,
            synthetic_pending: false,
        }
    }

    pub fn instruction() -> Self {
        Self {
            stepper: StepThreadController::instruction(),
            line_mode: false,
            queried: false,
            synthetic_pending: false,
        }
    }
}

impl ThreadController for StepIntoThreadController {
    fn name(&self) -> &'static str {
        "step-into"
    }

    fn init(&mut self, ctx: &mut StepContext) -> Result<InitOp, Error> {
        self.stepper.init(ctx)
    }

    fn continue_op(&mut self, ctx: &mut StepContext) -> ContinueOp {
        // the reveal decision belongs to the first resume query, not to
        // init: only here is it known the thread is really about to move
        if self.line_mode && !self.queried {
            self.queried = true;
            if ctx.stack.reveal_next_ambiguous_inline_frame() {
                debug!(
                    target: "step-into",
                    "entering pending inline frame at {} without executing", ctx.stack.pc()
                );
                self.synthetic_pending = true;
            }
        }
        if self.synthetic_pending {
            return ContinueOp::SyntheticStop;
        }
        self.stepper.continue_op(ctx)
    }

    fn on_stop(&mut self, stop: &StopNotification, ctx: &mut StepContext) -> OnStop {
        if self.synthetic_pending {
            return if stop.stop_type == StopType::Synthetic {
                self.synthetic_pending = false;
                OnStop::Op(StopOp::StopDone)
            } else {
                OnStop::Op(StopOp::Unexpected)
            };
        }
        self.stepper.on_stop(stop, ctx)
    }

    fn on_reply(&mut self, reply: &AgentReply, ctx: &mut StepContext) -> OnReply {
        self.stepper.on_reply(reply, ctx)
    }

    fn teardown(&mut self, ctx: &mut StepContext) {
        self.stepper.teardown(ctx);
    }
}
