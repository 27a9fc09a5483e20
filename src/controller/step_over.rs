use crate::address::AddressRanges;
use crate::controller::finish::FinishThreadController;
use crate::controller::step::StepThreadController;
use crate::controller::{
    stop_to_reply, ContinueOp, InitOp, OnReply, OnStop, StepContext, StopOp, ThreadController,
};
use crate::error::Error;
use crate::fingerprint::FrameFingerprint;
use crate::session::{AgentReply, ReplyPayload, RequestId, StopNotification};
use crate::stack::Stack;
use log::{debug, warn};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Pending {
    None,
    /// Frame sync issued after the stepper left its range.
    StopFingerprint(RequestId),
}

/// Range stepper that treats calls as opaque.
///
/// Wraps a [`StepThreadController`] and intercepts its range exits: leaving
/// the range downward (a fingerprint newer than the starting frame) means a
/// call was entered, which is finished transparently before stepping resumes
/// at the return site. Leaving sideways or upward is a real completion.
///
/// Before each depth comparison every inline frame entered exactly at the
/// stopped address is hidden, so landing on the first instruction of an
/// inline function after a step counts as "not entered yet" and the user
/// remains in the calling frame.
pub struct StepOverThreadController {
    stepper: StepThreadController,
    start_fingerprint: Option<FrameFingerprint>,
    finish: Option<Box<FinishThreadController>>,
    stop_in_subframe: Option<Box<dyn Fn(&Stack) -> bool>>,
    pending: Pending,
    initialized: bool,
}

impl StepOverThreadController {
    pub fn source_line() -> Self {
        Self::with_stepper(StepThreadController::source_line())
    }

    pub fn over_range(ranges: AddressRanges) -> Self {
        Self::with_stepper(StepThreadController::over_range(ranges))
    }

    fn with_stepper(stepper: StepThreadController) -> Self {
        Self {
            stepper,
            start_fingerprint: None,
            finish: None,
            stop_in_subframe: None,
            pending: Pending::None,
            initialized: false,
        }
    }

    /// Stop inside an entered subframe instead of finishing it when the
    /// predicate approves the current stack (e.g. "the callee has sources").
    pub fn stop_in_subframe_when(mut self, predicate: impl Fn(&Stack) -> bool + 'static) -> Self {
        self.stop_in_subframe = Some(Box::new(predicate));
        self
    }

    /// The stepper reported a range exit: decide whether this is a completed
    /// step or an entered call that must be finished first.
    fn on_left_range(&mut self, ctx: &mut StepContext) -> OnStop {
        let ambiguous = ctx.stack.ambiguous_inline_count();
        if ambiguous > ctx.stack.hidden_ambiguous_inline_count() {
            // inline code entered exactly at the stop address counts as not
            // entered yet, so the depth comparison sees the calling frame
            ctx.stack.set_hidden_ambiguous_inline_count(ambiguous);
        }

        let Some(current) = ctx.stack.fingerprint(0) else {
            let request = ctx.session.sync_frames();
            self.pending = Pending::StopFingerprint(request);
            return OnStop::Waiting;
        };
        let Some(start) = self.start_fingerprint else {
            return OnStop::Op(StopOp::StopDone);
        };

        if !current.newer_than(&start) {
            return OnStop::Op(StopOp::StopDone);
        }

        if let Some(predicate) = &self.stop_in_subframe {
            if predicate(ctx.stack) {
                debug!(target: "step-over", "stopping inside subframe at {}", ctx.stack.pc());
                return OnStop::Op(StopOp::StopDone);
            }
        }

        debug!(target: "step-over", "entered subframe {current}, finishing it");
        let mut finish = Box::new(FinishThreadController::new(0));
        match finish.init(ctx) {
            Ok(InitOp::Ready) => {
                self.finish = Some(finish);
                OnStop::Op(StopOp::Continue)
            }
            Ok(InitOp::Waiting) => {
                self.finish = Some(finish);
                OnStop::Waiting
            }
            Err(e) => {
                warn!(target: "step-over", "cannot finish entered subframe: {e}");
                OnStop::Op(StopOp::StopDone)
            }
        }
    }

    /// An internal finish brought the thread back to the return site;
    /// re-evaluate the position against the original ranges.
    fn after_finish(&mut self, ctx: &mut StepContext) -> OnStop {
        self.finish = None;
        match self.stepper.evaluate(ctx) {
            OnStop::Op(StopOp::StopDone) => self.on_left_range(ctx),
            other => other,
        }
    }
}

impl ThreadController for StepOverThreadController {
    fn name(&self) -> &'static str {
        "step-over"
    }

    fn init(&mut self, ctx: &mut StepContext) -> Result<InitOp, Error> {
        match self.stepper.init(ctx)? {
            InitOp::Ready => {
                self.start_fingerprint = ctx.stack.fingerprint(0);
                self.initialized = true;
                Ok(InitOp::Ready)
            }
            InitOp::Waiting => Ok(InitOp::Waiting),
        }
    }

    fn continue_op(&mut self, ctx: &mut StepContext) -> ContinueOp {
        match &mut self.finish {
            Some(finish) => finish.continue_op(ctx),
            None => self.stepper.continue_op(ctx),
        }
    }

    fn on_stop(&mut self, stop: &StopNotification, ctx: &mut StepContext) -> OnStop {
        if let Some(finish) = &mut self.finish {
            return match finish.on_stop(stop, ctx) {
                OnStop::Op(StopOp::StopDone) => self.after_finish(ctx),
                other => other,
            };
        }
        match self.stepper.on_stop(stop, ctx) {
            OnStop::Op(StopOp::StopDone) => self.on_left_range(ctx),
            other => other,
        }
    }

    fn on_reply(&mut self, reply: &AgentReply, ctx: &mut StepContext) -> OnReply {
        if let Pending::StopFingerprint(request) = self.pending {
            if request == reply.request {
                self.pending = Pending::None;
                return match &reply.payload {
                    ReplyPayload::FramesSynced(Ok(())) => stop_to_reply(self.on_left_range(ctx)),
                    ReplyPayload::FramesSynced(Err(e)) => {
                        warn!(target: "step-over", "frame sync failed after range exit: {e:#}");
                        OnReply::Decided(StopOp::StopDone)
                    }
                    _ => OnReply::Waiting,
                };
            }
        }

        if let Some(finish) = &mut self.finish {
            return match finish.on_reply(reply, ctx) {
                // the finish was installed mid-run, so its readiness means
                // "resume", and its setup failure degrades to a stop
                OnReply::Ready => OnReply::Decided(StopOp::Continue),
                OnReply::Failed(e) => {
                    warn!(target: "step-over", "subframe finish setup failed: {e}");
                    self.finish = None;
                    OnReply::Decided(StopOp::StopDone)
                }
                OnReply::Decided(StopOp::StopDone) => stop_to_reply(self.after_finish(ctx)),
                other => other,
            };
        }

        match self.stepper.on_reply(reply, ctx) {
            OnReply::Ready if !self.initialized => {
                self.start_fingerprint = ctx.stack.fingerprint(0);
                self.initialized = true;
                OnReply::Ready
            }
            OnReply::Decided(StopOp::StopDone) => stop_to_reply(self.on_left_range(ctx)),
            other => other,
        }
    }

    fn teardown(&mut self, ctx: &mut StepContext) {
        if let Some(mut finish) = self.finish.take() {
            finish.teardown(ctx);
        }
        self.stepper.teardown(ctx);
    }
}
