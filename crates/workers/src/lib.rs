//! Worker process pool and worker runtime for robolink
//!
//! Decode and transcode run outside the gateway process: each worker class
//! gets its own child process with a private bus connection, commanded over
//! stdin and streaming frames back over stdout. A crash in a codec takes
//! down one worker, not the gateway. The [`pool`] module is the gateway
//! side, [`runner`] the worker side; the `robolink-worker` binary is a thin
//! wrapper around [`runner::run_worker`].

pub mod class;
pub mod encode;
pub mod error;
pub mod pool;
pub mod runner;

pub use class::WorkerClass;
pub use error::{Error, Result};
pub use pool::{InProcessLauncher, ProcessLauncher, WorkerBinding, WorkerIo, WorkerLauncher, WorkerPool};
pub use runner::{run_worker, WorkerSettings};
