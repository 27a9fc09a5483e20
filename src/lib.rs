//! Thread stepping engine for a remote debugger client.
//!
//! The debugged process lives behind an asynchronous agent connection; every
//! interaction with it (resume, breakpoints, stack sync) is a request/reply
//! round trip. This crate implements the client-side stepping logic on top of
//! that: a [`thread::Thread`] owns the cached call stack of one stopped
//! thread and at most one [`controller::ThreadController`], and routes agent
//! events into it until the stepping operation completes with a user-visible
//! stop.
//!
//! Everything is single-threaded and callback-free on the inside: the
//! embedding event loop calls the `Thread::on_*` entry points and acts on the
//! returned [`thread::StopDisposition`].

pub mod address;
pub mod breakpoint;
pub mod controller;
pub mod error;
pub mod fingerprint;
pub mod session;
pub mod stack;
pub mod thread;

pub use error::Error;
