use crate::address::AddressRanges;
use crate::controller::finish::FinishThreadController;
use crate::controller::{
    stop_to_reply, ContinueOp, InitOp, OnReply, OnStop, StepContext, StopOp,
    ThreadController,
};
use crate::error::Error;
use crate::fingerprint::FrameFingerprint;
use crate::session::{AgentReply, ReplyPayload, RequestId, StopNotification, StopType};
use crate::stack::FileLine;
use anyhow::anyhow;
use log::{debug, warn};

/// What the step controller is asked to stay within.
#[derive(Clone, Debug)]
pub enum StepMode {
    /// Step until the thread leaves the current source line.
    SourceLine,
    /// Step until the thread leaves an explicit address range set.
    Range(AddressRanges),
    /// Exactly one machine instruction.
    Instruction,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Pending {
    None,
    /// Frame sync issued during init.
    InitFrames(RequestId),
    /// Frame sync issued while deciding what a range exit means.
    StopFingerprint(RequestId),
}

/// Stay-in-range stepper.
///
/// In source-line mode the active ranges evolve: additional line table entries
/// for the starting line (and line-0 bookkeeping entries) are absorbed as the
/// thread reaches them. Leaving the ranges into code without any line
/// information triggers the unsymbolized-code heuristic: a trampoline inside a
/// symbolized module falls back to raw instruction stepping, a call into an
/// unsymbolized module is finished transparently, a bare jump is reported to
/// the user.
pub struct StepThreadController {
    mode: StepMode,
    current_ranges: AddressRanges,
    original_line: Option<FileLine>,
    original_fingerprint: Option<FrameFingerprint>,
    finish_unsymbolized: Option<Box<FinishThreadController>>,
    pending: Pending,
}

impl StepThreadController {
    pub fn source_line() -> Self {
        Self::with_mode(StepMode::SourceLine)
    }

    pub fn over_range(ranges: AddressRanges) -> Self {
        Self::with_mode(StepMode::Range(ranges))
    }

    pub fn instruction() -> Self {
        Self::with_mode(StepMode::Instruction)
    }

    fn with_mode(mode: StepMode) -> Self {
        Self {
            mode,
            current_ranges: AddressRanges::empty(),
            original_line: None,
            original_fingerprint: None,
            finish_unsymbolized: None,
            pending: Pending::None,
        }
    }

    pub fn is_source_line_mode(&self) -> bool {
        matches!(self.mode, StepMode::SourceLine)
    }

    fn finish_init(&mut self, ctx: &mut StepContext) -> Result<InitOp, Error> {
        self.original_fingerprint = ctx.stack.fingerprint(0);
        match &self.mode {
            StepMode::SourceLine => {
                let pc = ctx.stack.pc();
                match ctx.session.line_info(pc) {
                    Some(info) => {
                        debug!(
                            target: "step",
                            "stepping within {} of line {}", info.range, info.file_line
                        );
                        self.original_line = Some(info.file_line);
                        self.current_ranges = AddressRanges::from(info.range);
                    }
                    // no line info at the starting point: degrade to raw
                    // instruction stepping until symbols appear
                    None => debug!(target: "step", "no line info at {pc}, stepping by instruction"),
                }
            }
            StepMode::Range(ranges) => self.current_ranges = ranges.clone(),
            StepMode::Instruction => {}
        }
        Ok(InitOp::Ready)
    }

    /// Decide what the current position means for this step. Assumes the
    /// stop-type filter has already been applied (or deliberately bypassed,
    /// e.g. after an internal finish completed on its own breakpoint).
    pub(crate) fn evaluate(&mut self, ctx: &mut StepContext) -> OnStop {
        let pc = ctx.stack.pc();
        if self.current_ranges.contains(pc) {
            debug!(target: "step", "{pc} still in range, continue");
            return OnStop::Op(StopOp::Continue);
        }

        match self.mode {
            StepMode::Instruction | StepMode::Range(_) => return self.report_stop(ctx),
            StepMode::SourceLine => {}
        }

        match ctx.session.line_info(pc) {
            Some(info) => {
                let same_line = self
                    .original_line
                    .as_ref()
                    .is_some_and(|original| *original == info.file_line);
                if same_line || info.file_line.line == 0 {
                    debug!(
                        target: "step",
                        "absorbing {} (line {}) into the active ranges", info.range, info.file_line
                    );
                    self.current_ranges.extend_with(info.range);
                    OnStop::Op(StopOp::Continue)
                } else {
                    debug!(target: "step", "reached new line {} at {pc}", info.file_line);
                    self.report_stop(ctx)
                }
            }
            None => self.evaluate_unsymbolized(ctx),
        }
    }

    fn evaluate_unsymbolized(&mut self, ctx: &mut StepContext) -> OnStop {
        let pc = ctx.stack.pc();
        if ctx.session.module_has_symbols(pc) {
            // an unsymbolized trampoline inside a symbolized module: step by
            // instruction until the line table picks the thread up again
            debug!(target: "step", "no line info at {pc} in a symbolized module, stepping raw");
            self.current_ranges = AddressRanges::empty();
            return OnStop::Op(StopOp::Continue);
        }

        let Some(current) = ctx.stack.fingerprint(0) else {
            let request = ctx.session.sync_frames();
            self.pending = Pending::StopFingerprint(request);
            return OnStop::Waiting;
        };
        let Some(original) = self.original_fingerprint else {
            // never fingerprinted the starting frame (truncated stack at
            // init), so a call cannot be told from a jump
            return self.report_stop(ctx);
        };

        if current.newer_than(&original) {
            // a call was made into unsymbolized code: run it to completion
            // and resume stepping at the return site. A tail call reusing the
            // caller frame defeats this test and is reported as a plain stop.
            debug!(target: "step", "call into unsymbolized code at {pc}, finishing it");
            let mut finish = Box::new(FinishThreadController::new(0));
            match finish.init(ctx) {
                Ok(InitOp::Ready) => {
                    self.finish_unsymbolized = Some(finish);
                    OnStop::Op(StopOp::Continue)
                }
                Ok(InitOp::Waiting) => {
                    self.finish_unsymbolized = Some(finish);
                    OnStop::Waiting
                }
                Err(e) => {
                    warn!(target: "step", "cannot finish unsymbolized code: {e}");
                    self.report_stop(ctx)
                }
            }
        } else {
            // a bare jump into unsymbolized code: report to the user
            debug!(target: "step", "jump into unsymbolized code at {pc}, stop");
            self.report_stop(ctx)
        }
    }

    /// A genuine stop. If the landing address is an ambiguous inline entry,
    /// expose the oldest such frame so a following step-into can descend one
    /// inline level at a time.
    fn report_stop(&mut self, ctx: &mut StepContext) -> OnStop {
        let ambiguous = ctx.stack.ambiguous_inline_count();
        if ambiguous > 0 {
            ctx.stack.set_hidden_ambiguous_inline_count(ambiguous - 1);
        }
        OnStop::Op(StopOp::StopDone)
    }
}

impl ThreadController for StepThreadController {
    fn name(&self) -> &'static str {
        "step"
    }

    fn init(&mut self, ctx: &mut StepContext) -> Result<InitOp, Error> {
        if ctx.stack.fingerprint(0).is_none() {
            let request = ctx.session.sync_frames();
            self.pending = Pending::InitFrames(request);
            return Ok(InitOp::Waiting);
        }
        self.finish_init(ctx)
    }

    fn continue_op(&mut self, ctx: &mut StepContext) -> ContinueOp {
        if let Some(finish) = &mut self.finish_unsymbolized {
            return finish.continue_op(ctx);
        }
        match self.current_ranges.range_containing(ctx.stack.pc()) {
            Some(range) => ContinueOp::StepInRange(range),
            None => ContinueOp::StepInstruction,
        }
    }

    fn on_stop(&mut self, stop: &StopNotification, ctx: &mut StepContext) -> OnStop {
        if let Some(finish) = &mut self.finish_unsymbolized {
            return match finish.on_stop(stop, ctx) {
                OnStop::Op(StopOp::StopDone) => {
                    debug!(target: "step", "unsymbolized code finished, resume stepping");
                    self.finish_unsymbolized = None;
                    // the finish completed on its own qualified breakpoint
                    // hit, so the stop-type filter does not apply here
                    self.evaluate(ctx)
                }
                other => other,
            };
        }

        // only hardware single-step exceptions are evaluated against the
        // ranges; anything else (crash, hardcoded breakpoint inside the
        // range) is not this controller's stop
        if stop.stop_type != StopType::SingleStep {
            return OnStop::Op(StopOp::Unexpected);
        }
        self.evaluate(ctx)
    }

    fn on_reply(&mut self, reply: &AgentReply, ctx: &mut StepContext) -> OnReply {
        match self.pending {
            Pending::InitFrames(request) if request == reply.request => {
                self.pending = Pending::None;
                return match &reply.payload {
                    ReplyPayload::FramesSynced(Ok(())) => match self.finish_init(ctx) {
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
            Pending::StopFingerprint(request) if request == reply.request => {
                self.pending = Pending::None;
                return match &reply.payload {
                    ReplyPayload::FramesSynced(Ok(())) => {
                        stop_to_reply(self.evaluate_unsymbolized(ctx))
                    }
                    ReplyPayload::FramesSynced(Err(e)) => {
                        warn!(target: "step", "frame sync failed mid-step: {e:#}");
                        OnReply::Decided(StopOp::StopDone)
                    }
                    _ => OnReply::Waiting,
                };
            }
            _ => {}
        }

        if let Some(finish) = &mut self.finish_unsymbolized {
            return match finish.on_reply(reply, ctx) {
                // installed mid-step, so its readiness means "resume"
                OnReply::Ready => OnReply::Decided(StopOp::Continue),
                OnReply::Failed(e) => {
                    warn!(target: "step", "cannot finish unsymbolized code: {e}");
                    if let Some(mut finish) = self.finish_unsymbolized.take() {
                        finish.teardown(ctx);
                    }
                    OnReply::Decided(StopOp::StopDone)
                }
                OnReply::Decided(StopOp::StopDone) => {
                    self.finish_unsymbolized = None;
                    stop_to_reply(self.evaluate(ctx))
                }
                other => other,
            };
        }
        OnReply::Unclaimed
    }

    fn teardown(&mut self, ctx: &mut StepContext) {
        if let Some(mut finish) = self.finish_unsymbolized.take() {
            finish.teardown(ctx);
        }
    }
}
