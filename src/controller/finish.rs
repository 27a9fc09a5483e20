use crate::address::AddressRanges;
use crate::controller::step_over::StepOverThreadController;
use crate::controller::until::UntilThreadController;
use crate::controller::{
    stop_to_reply, ContinueOp, InitOp, OnReply, OnStop, StepContext, StopOp, ThreadController,
};
use crate::error::Error;
use crate::fingerprint::FrameFingerprint;
use crate::session::{AgentReply, ReplyPayload, RequestId, StopNotification};
use crate::stack::FrameKind;
use anyhow::anyhow;
use log::{debug, warn};

enum PhysicalState {
    New,
    WaitFrames(RequestId),
    /// No usable return site: run free and report the next stop, whatever it
    /// is.
    Elide,
    Until(UntilThreadController),
}

/// Runs the thread until the physical frame hosting `frame_index` returns.
///
/// Implemented as a gated [`UntilThreadController`] at the caller's resume
/// address: the gate is the exited frame's own fingerprint, so a recursive
/// re-entry of the same return address at a deeper stack depth does not
/// terminate the operation.
pub struct FinishPhysicalFrameThreadController {
    frame_index: usize,
    state: PhysicalState,
}

impl FinishPhysicalFrameThreadController {
    pub fn new(frame_index: usize) -> Self {
        Self {
            frame_index,
            state: PhysicalState::New,
        }
    }

    fn setup(&mut self, ctx: &mut StepContext) -> Result<InitOp, Error> {
        let Some(fingerprint) = ctx.stack.fingerprint(self.frame_index) else {
            if ctx.stack.is_complete() {
                return Err(Error::FrameNotFound(self.frame_index));
            }
            let request = ctx.session.sync_frames();
            self.state = PhysicalState::WaitFrames(request);
            return Ok(InitOp::Waiting);
        };

        match ctx.stack.frame(self.frame_index + 1) {
            Some(caller) if !caller.ip.is_null() => {
                let mut until = UntilThreadController::with_gate(caller.ip, fingerprint);
                let op = until.init(ctx)?;
                self.state = PhysicalState::Until(until);
                Ok(op)
            }
            _ => {
                debug!(
                    target: "finish",
                    "frame {} has no return site, free-running until the next stop",
                    self.frame_index
                );
                self.state = PhysicalState::Elide;
                Ok(InitOp::Ready)
            }
        }
    }
}

impl ThreadController for FinishPhysicalFrameThreadController {
    fn name(&self) -> &'static str {
        "finish-physical"
    }

    fn init(&mut self, ctx: &mut StepContext) -> Result<InitOp, Error> {
        self.setup(ctx)
    }

    fn continue_op(&mut self, ctx: &mut StepContext) -> ContinueOp {
        match &mut self.state {
            PhysicalState::Until(until) => until.continue_op(ctx),
            _ => ContinueOp::Continue,
        }
    }

    fn on_stop(&mut self, stop: &StopNotification, ctx: &mut StepContext) -> OnStop {
        match &mut self.state {
            PhysicalState::Until(until) => until.on_stop(stop, ctx),
            PhysicalState::Elide => OnStop::Op(StopOp::StopDone),
            PhysicalState::New | PhysicalState::WaitFrames(_) => OnStop::Op(StopOp::Unexpected),
        }
    }

    fn on_reply(&mut self, reply: &AgentReply, ctx: &mut StepContext) -> OnReply {
        if matches!(&self.state, PhysicalState::WaitFrames(r) if *r == reply.request) {
            return match &reply.payload {
                ReplyPayload::FramesSynced(Ok(())) => match self.setup(ctx) {
                    Ok(InitOp::Ready) => OnReply::Ready,
                    Ok(InitOp::Waiting) => OnReply::Waiting,
                    Err(e) => OnReply::Failed(e),
                },
                ReplyPayload::FramesSynced(Err(e)) => {
                    OnReply::Failed(Error::FrameSync(anyhow!("{e:#}")))
                }
                _ => OnReply::Waiting,
            };
        }
        match &mut self.state {
            PhysicalState::Until(until) => until.on_reply(reply, ctx),
            _ => OnReply::Unclaimed,
        }
    }

    fn teardown(&mut self, ctx: &mut StepContext) {
        if let PhysicalState::Until(until) = &mut self.state {
            until.teardown(ctx);
        }
    }
}

enum FinishPhase {
    New,
    WaitInit(RequestId),
    /// Unwinding the newest physical frame at or below the target.
    Physical(FinishPhysicalFrameThreadController),
    /// Frame sync in flight between layers.
    WaitLayer(RequestId),
    /// Stepping out of one inline expansion of the target's host frame.
    InlineStep(Box<StepOverThreadController>),
    Done,
}

enum Claimed {
    Init,
    Layer,
}

/// Runs the thread until `frame_index` (physical or inline) returns.
///
/// A physical target is a single [`FinishPhysicalFrameThreadController`] pass.
/// An inline target needs two stages: unwind the outermost physical frame
/// newer than it (if any), then repeatedly step over the remaining inline
/// expansions of the host frame until the fingerprint shows the target layer
/// gone. Inline exits never execute a return, so the second stage is plain
/// range stepping.
pub struct FinishThreadController {
    frame_index: usize,
    target: Option<FrameFingerprint>,
    initialized: bool,
    phase: FinishPhase,
}

impl FinishThreadController {
    pub fn new(frame_index: usize) -> Self {
        Self {
            frame_index,
            target: None,
            initialized: false,
            phase: FinishPhase::New,
        }
    }

    fn resolve(&mut self, ctx: &mut StepContext) -> Result<InitOp, Error> {
        let Some(target) = ctx.stack.fingerprint(self.frame_index) else {
            if ctx.stack.is_complete() {
                return Err(Error::FrameNotFound(self.frame_index));
            }
            let request = ctx.session.sync_frames();
            self.phase = FinishPhase::WaitInit(request);
            return Ok(InitOp::Waiting);
        };
        self.target = Some(target);
        debug!(target: "finish", "finishing frame {} ({target})", self.frame_index);

        let target_is_inline = ctx
            .stack
            .frame(self.frame_index)
            .is_some_and(|f| f.is_inline());
        if !target_is_inline {
            let mut inner = FinishPhysicalFrameThreadController::new(self.frame_index);
            let op = inner.init(ctx)?;
            self.phase = FinishPhase::Physical(inner);
            return Ok(op);
        }

        // newest frames first, so the outermost physical frame below the
        // target is the highest such index
        let physical_below = (0..self.frame_index)
            .rev()
            .find(|&i| ctx.stack.frame(i).is_some_and(|f| !f.is_inline()));
        match physical_below {
            Some(index) => {
                let mut inner = FinishPhysicalFrameThreadController::new(index);
                let op = inner.init(ctx)?;
                self.phase = FinishPhase::Physical(inner);
                Ok(op)
            }
            None => self.enter_inline_layer(ctx),
        }
    }

    /// Install a range step over the innermost inline expansion.
    fn enter_inline_layer(&mut self, ctx: &mut StepContext) -> Result<InitOp, Error> {
        let Some(frame) = ctx.stack.frame(0) else {
            return Err(Error::StackChanged);
        };
        let FrameKind::Inline { range } = frame.kind else {
            // the fingerprint said there are inline layers left but the top
            // frame is physical now
            return Err(Error::StackChanged);
        };
        let mut stepper = Box::new(StepOverThreadController::over_range(AddressRanges::from(
            range,
        )));
        let op = stepper.init(ctx)?;
        self.phase = FinishPhase::InlineStep(stepper);
        Ok(op)
    }

    /// One stage is finished: either the whole operation is done or the next
    /// inline layer must be stepped out of.
    fn next_layer(&mut self, ctx: &mut StepContext) -> OnStop {
        let Some(target) = self.target else {
            return OnStop::Op(StopOp::StopDone);
        };
        let Some(current) = ctx.stack.fingerprint(0) else {
            let request = ctx.session.sync_frames();
            self.phase = FinishPhase::WaitLayer(request);
            return OnStop::Waiting;
        };

        let exited = target.newer_than(&current)
            || (current.frame_address() == target.frame_address()
                && current.inline_depth() < target.inline_depth());
        if exited {
            debug!(target: "finish", "target {target} exited, now at {current}");
            self.phase = FinishPhase::Done;
            return OnStop::Op(StopOp::StopDone);
        }

        debug!(target: "finish", "still at {current}, stepping out of one inline layer");
        match self.enter_inline_layer(ctx) {
            Ok(InitOp::Ready) => OnStop::Op(StopOp::Continue),
            Ok(InitOp::Waiting) => OnStop::Waiting,
            Err(e) => {
                warn!(target: "finish", "cannot step out of inline frame: {e}");
                self.phase = FinishPhase::Done;
                OnStop::Op(StopOp::StopDone)
            }
        }
    }

    fn teardown_phase(&mut self, ctx: &mut StepContext) {
        match &mut self.phase {
            FinishPhase::Physical(inner) => inner.teardown(ctx),
            FinishPhase::InlineStep(inner) => inner.teardown(ctx),
            _ => {}
        }
    }
}

impl ThreadController for FinishThreadController {
    fn name(&self) -> &'static str {
        "finish"
    }

    fn init(&mut self, ctx: &mut StepContext) -> Result<InitOp, Error> {
        let op = self.resolve(ctx)?;
        if op == InitOp::Ready {
            self.initialized = true;
        }
        Ok(op)
    }

    fn continue_op(&mut self, ctx: &mut StepContext) -> ContinueOp {
        match &mut self.phase {
            FinishPhase::Physical(inner) => inner.continue_op(ctx),
            FinishPhase::InlineStep(inner) => inner.continue_op(ctx),
            _ => ContinueOp::Continue,
        }
    }

    fn on_stop(&mut self, stop: &StopNotification, ctx: &mut StepContext) -> OnStop {
        match &mut self.phase {
            FinishPhase::Physical(inner) => match inner.on_stop(stop, ctx) {
                OnStop::Op(StopOp::StopDone) => inner.teardown(ctx),
                other => return other,
            },
            FinishPhase::InlineStep(inner) => match inner.on_stop(stop, ctx) {
                OnStop::Op(StopOp::StopDone) => inner.teardown(ctx),
                other => return other,
            },
            _ => return OnStop::Op(StopOp::Unexpected),
        }
        self.next_layer(ctx)
    }

    fn on_reply(&mut self, reply: &AgentReply, ctx: &mut StepContext) -> OnReply {
        let claimed = match &self.phase {
            FinishPhase::WaitInit(r) if *r == reply.request => Some(Claimed::Init),
            FinishPhase::WaitLayer(r) if *r == reply.request => Some(Claimed::Layer),
            _ => None,
        };
        match claimed {
            Some(Claimed::Init) => {
                return match &reply.payload {
                    ReplyPayload::FramesSynced(Ok(())) => match self.resolve(ctx) {
                        Ok(InitOp::Ready) => {
                            self.initialized = true;
                            OnReply::Ready
                        }
                        Ok(InitOp::Waiting) => OnReply::Waiting,
                        Err(e) => OnReply::Failed(e),
                    },
                    ReplyPayload::FramesSynced(Err(e)) => {
                        OnReply::Failed(Error::FrameSync(anyhow!("{e:#}")))
                    }
                    _ => OnReply::Waiting,
                };
            }
            Some(Claimed::Layer) => {
                return match &reply.payload {
                    ReplyPayload::FramesSynced(Ok(())) => stop_to_reply(self.next_layer(ctx)),
                    ReplyPayload::FramesSynced(Err(e)) => {
                        warn!(
                            target: "finish",
                            "frame sync failed while leaving inline frames: {e:#}"
                        );
                        self.phase = FinishPhase::Done;
                        OnReply::Decided(StopOp::StopDone)
                    }
                    _ => OnReply::Waiting,
                };
            }
            None => {}
        }

        let outcome = match &mut self.phase {
            FinishPhase::Physical(inner) => inner.on_reply(reply, ctx),
            FinishPhase::InlineStep(inner) => inner.on_reply(reply, ctx),
            _ => return OnReply::Unclaimed,
        };
        match outcome {
            OnReply::Ready if self.initialized => OnReply::Decided(StopOp::Continue),
            OnReply::Ready => {
                self.initialized = true;
                OnReply::Ready
            }
            OnReply::Failed(e) if self.initialized => {
                warn!(target: "finish", "delegate setup failed mid-flight: {e}");
                self.teardown_phase(ctx);
                self.phase = FinishPhase::Done;
                OnReply::Decided(StopOp::StopDone)
            }
            OnReply::Decided(StopOp::StopDone) => {
                self.teardown_phase(ctx);
                stop_to_reply(self.next_layer(ctx))
            }
            other => other,
        }
    }

    fn teardown(&mut self, ctx: &mut StepContext) {
        self.teardown_phase(ctx);
        self.phase = FinishPhase::Done;
    }
}
