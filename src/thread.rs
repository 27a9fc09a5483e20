use crate::breakpoint::{AddDisposition, BreakpointRegistry};
use crate::controller::{ContinueOp, InitOp, OnReply, OnStop, StepContext, StopOp, ThreadController};
use crate::error::Error;
use crate::session::{
    AgentReply, BreakpointId, DebugSession, HitBreakpoints, ReplyPayload, RequestId,
    StopNotification, StopType,
};
use crate::stack::{Frame, Stack};
use log::{debug, warn};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ThreadId(pub u32);

/// What happened to the thread as a result of one external event.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StopDisposition {
    /// The thread was (or stayed) resumed.
    Resumed,
    /// The thread is stopped and the stop is user-visible.
    Stopped,
    /// The thread is suspended while an agent round trip completes; no
    /// user-visible state change yet.
    Waiting,
}

/// Invoked once stepping setup completes (possibly asynchronously). An error
/// means the operation never started and the thread is still stopped.
pub type InitCompletion = Box<dyn FnOnce(Result<(), Error>)>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Stopped,
    /// Controller installed, init round trip in flight, thread suspended.
    InitPending,
    Running,
    /// Stop received, controller verdict deferred behind a round trip.
    DecisionPending,
}

/// One debugged thread: its cached stack, the active stepping controller and
/// the routing of agent events into it.
///
/// Single-owner and fully synchronous: every external event enters through
/// one of the `on_*` methods, gets routed into the controller, and the
/// resulting state transition happens before the method returns. At most one
/// controller is installed at a time; a new stepping command supersedes a
/// suspended one.
pub struct Thread {
    id: ThreadId,
    stack: Stack,
    controller: Option<Box<dyn ThreadController>>,
    init_completion: Option<InitCompletion>,
    breakpoints: BreakpointRegistry,
    phase: Phase,
}

impl Thread {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            stack: Stack::default(),
            controller: None,
            init_completion: None,
            breakpoints: BreakpointRegistry::default(),
            phase: Phase::Stopped,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn is_stepping(&self) -> bool {
        self.controller.is_some()
    }

    fn disposition(&self) -> StopDisposition {
        match self.phase {
            Phase::Stopped => StopDisposition::Stopped,
            Phase::Running => StopDisposition::Resumed,
            Phase::InitPending | Phase::DecisionPending => StopDisposition::Waiting,
        }
    }

    /// Start a stepping operation. The completion fires exactly once, when
    /// setup succeeds (the thread resumes) or fails (it stays stopped). A
    /// previously installed controller is torn down first and its pending
    /// completion, if any, resolves to [`Error::Superseded`].
    pub fn continue_with(
        &mut self,
        mut controller: Box<dyn ThreadController>,
        session: &mut dyn DebugSession,
        completion: InitCompletion,
    ) -> Result<StopDisposition, Error> {
        if self.phase == Phase::Running {
            return Err(Error::AlreadyRunning);
        }
        self.clear_controller(session);

        debug!(target: "thread", "thread {:?}: installing {} controller", self.id, controller.name());
        let init = {
            let mut ctx = StepContext {
                stack: &mut self.stack,
                session,
                breakpoints: &mut self.breakpoints,
            };
            controller.init(&mut ctx)
        };
        match init {
            Ok(InitOp::Ready) => {
                self.controller = Some(controller);
                completion(Ok(()));
                Ok(self.resume(session))
            }
            Ok(InitOp::Waiting) => {
                self.controller = Some(controller);
                self.init_completion = Some(completion);
                self.phase = Phase::InitPending;
                Ok(StopDisposition::Waiting)
            }
            Err(e) => {
                let mut ctx = StepContext {
                    stack: &mut self.stack,
                    session,
                    breakpoints: &mut self.breakpoints,
                };
                controller.teardown(&mut ctx);
                completion(Err(e));
                Ok(StopDisposition::Stopped)
            }
        }
    }

    /// Resume without installing anything. An installed controller (left in
    /// place by a stop it disclaimed) keeps steering the resume.
    pub fn continue_execution(
        &mut self,
        session: &mut dyn DebugSession,
    ) -> Result<StopDisposition, Error> {
        if self.phase == Phase::Running {
            return Err(Error::AlreadyRunning);
        }
        Ok(self.resume(session))
    }

    /// Abandon the current stepping operation, if any.
    pub fn clear_controller(&mut self, session: &mut dyn DebugSession) {
        if let Some(mut controller) = self.controller.take() {
            debug!(target: "thread", "thread {:?}: dropping {} controller", self.id, controller.name());
            let mut ctx = StepContext {
                stack: &mut self.stack,
                session,
                breakpoints: &mut self.breakpoints,
            };
            controller.teardown(&mut ctx);
        }
        if let Some(completion) = self.init_completion.take() {
            completion(Err(Error::Superseded));
        }
        if self.phase != Phase::Running {
            self.phase = Phase::Stopped;
        }
    }

    /// The agent reported an execution stop.
    pub fn on_exception(
        &mut self,
        stop: &StopNotification,
        session: &mut dyn DebugSession,
    ) -> StopDisposition {
        self.stack.set_frames(stop.frames.clone(), stop.frames_complete);
        self.dispatch_stop(stop, session)
    }

    /// Completion of a [`DebugSession::sync_frames`] request. On success the
    /// new frames replace the cached stack before the reply is routed.
    pub fn on_frames_synced(
        &mut self,
        request: RequestId,
        result: Result<(Vec<Frame>, bool), anyhow::Error>,
        session: &mut dyn DebugSession,
    ) -> StopDisposition {
        let payload = match result {
            Ok((frames, complete)) => {
                self.stack.set_frames(frames, complete);
                ReplyPayload::FramesSynced(Ok(()))
            }
            Err(e) => ReplyPayload::FramesSynced(Err(e)),
        };
        self.route_reply(AgentReply { request, payload }, session)
    }

    /// Completion of a [`DebugSession::add_breakpoint`] request. A
    /// registration whose owner was torn down while the round trip was in
    /// flight is cleaned up here and never reaches a controller.
    pub fn on_breakpoint_added(
        &mut self,
        request: RequestId,
        result: Result<BreakpointId, anyhow::Error>,
        session: &mut dyn DebugSession,
    ) -> StopDisposition {
        if self.breakpoints.complete(request) == AddDisposition::Orphaned {
            if let Ok(id) = result {
                debug!(target: "thread", "removing orphaned breakpoint {id:?}");
                let _ = session.remove_breakpoint(id);
            }
            return self.disposition();
        }
        self.route_reply(
            AgentReply {
                request,
                payload: ReplyPayload::BreakpointAdded(result),
            },
            session,
        )
    }

    /// Completion of a [`DebugSession::remove_breakpoint`] request. Removal
    /// is fire-and-forget for every controller, so failures are only logged.
    pub fn on_breakpoint_removed(
        &mut self,
        request: RequestId,
        result: Result<(), anyhow::Error>,
        session: &mut dyn DebugSession,
    ) -> StopDisposition {
        if let Err(e) = &result {
            warn!(target: "thread", "breakpoint removal failed: {e:#}");
        }
        self.route_reply(
            AgentReply {
                request,
                payload: ReplyPayload::BreakpointRemoved(result),
            },
            session,
        )
    }

    fn resume(&mut self, session: &mut dyn DebugSession) -> StopDisposition {
        let op = match &mut self.controller {
            Some(controller) => {
                let mut ctx = StepContext {
                    stack: &mut self.stack,
                    session,
                    breakpoints: &mut self.breakpoints,
                };
                controller.continue_op(&mut ctx)
            }
            None => ContinueOp::Continue,
        };

        if op == ContinueOp::SyntheticStop {
            // no execution: report a locally synthesized stop against the
            // unchanged cached stack
            let stop = StopNotification {
                stop_type: StopType::Synthetic,
                hit_breakpoints: HitBreakpoints::new(),
                frames: Vec::new(),
                frames_complete: false,
            };
            return self.dispatch_stop(&stop, session);
        }

        debug!(target: "thread", "thread {:?}: resume with {op:?}", self.id);
        session.resume(op);
        self.phase = Phase::Running;
        StopDisposition::Resumed
    }

    fn dispatch_stop(
        &mut self,
        stop: &StopNotification,
        session: &mut dyn DebugSession,
    ) -> StopDisposition {
        self.phase = Phase::Stopped;
        debug!(target: "thread", "thread {:?}: {} stop", self.id, stop.stop_type);
        if self.controller.is_none() {
            return StopDisposition::Stopped;
        }

        let outcome = {
            let controller = match &mut self.controller {
                Some(controller) => controller,
                None => return StopDisposition::Stopped,
            };
            let mut ctx = StepContext {
                stack: &mut self.stack,
                session,
                breakpoints: &mut self.breakpoints,
            };
            controller.on_stop(stop, &mut ctx)
        };
        match outcome {
            OnStop::Op(op) => self.apply_stop_op(op, session),
            OnStop::Waiting => {
                self.phase = Phase::DecisionPending;
                StopDisposition::Waiting
            }
        }
    }

    fn route_reply(
        &mut self,
        reply: AgentReply,
        session: &mut dyn DebugSession,
    ) -> StopDisposition {
        if self.controller.is_none() {
            return self.disposition();
        }

        let outcome = {
            let controller = match &mut self.controller {
                Some(controller) => controller,
                None => return self.disposition(),
            };
            let mut ctx = StepContext {
                stack: &mut self.stack,
                session,
                breakpoints: &mut self.breakpoints,
            };
            controller.on_reply(&reply, &mut ctx)
        };
        match outcome {
            OnReply::Unclaimed | OnReply::Waiting => self.disposition(),
            OnReply::Ready => {
                if let Some(completion) = self.init_completion.take() {
                    completion(Ok(()));
                }
                self.resume(session)
            }
            OnReply::Failed(e) => {
                warn!(target: "thread", "thread {:?}: stepping setup failed: {e}", self.id);
                self.drop_controller(session);
                if let Some(completion) = self.init_completion.take() {
                    completion(Err(e));
                }
                self.phase = Phase::Stopped;
                StopDisposition::Stopped
            }
            OnReply::Decided(op) => self.apply_stop_op(op, session),
        }
    }

    fn apply_stop_op(&mut self, op: StopOp, session: &mut dyn DebugSession) -> StopDisposition {
        match op {
            StopOp::Continue => self.resume(session),
            StopOp::StopDone => {
                self.drop_controller(session);
                self.phase = Phase::Stopped;
                StopDisposition::Stopped
            }
            StopOp::Unexpected => {
                // not the controller's stop: report it to the user, keep the
                // controller installed so the operation can be resumed
                debug!(target: "thread", "thread {:?}: stop out of stepping scope", self.id);
                self.phase = Phase::Stopped;
                StopDisposition::Stopped
            }
        }
    }

    fn drop_controller(&mut self, session: &mut dyn DebugSession) {
        if let Some(mut controller) = self.controller.take() {
            let mut ctx = StepContext {
                stack: &mut self.stack,
                session,
                breakpoints: &mut self.breakpoints,
            };
            controller.teardown(&mut ctx);
        }
    }
}
