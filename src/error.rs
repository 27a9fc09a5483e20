#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("thread is already running")]
    AlreadyRunning,
    #[error("frame number {0} not found")]
    FrameNotFound(usize),
    #[error("stack changed during setup, target frame no longer present")]
    StackChanged,
    #[error("frame sync failed: {0:#}")]
    FrameSync(anyhow::Error),
    #[error("breakpoint registration failed: {0:#}")]
    BreakpointAdd(anyhow::Error),
    #[error("stepping operation superseded by a new command")]
    Superseded,
}
