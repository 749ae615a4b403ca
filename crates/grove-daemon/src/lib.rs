//! groved, the daemon behind the grove CLI.
//!
//! Supervises concurrent AI coding agent sessions on one workstation. Each
//! session ("instance") is a git worktree + Docker container + agent process
//! triple; the agent runs under a host-side PTY whose output is fanned out
//! to an on-disk log, a bounded in-memory buffer, and at most one attached
//! interactive client.
//!
//! Module map:
//! - [`project`]: registrations, in-repo config overlay, git worktrees
//! - [`container`]: Docker runtime (run/compose/exec/teardown, mounts)
//! - [`pty`]: PTY allocation and agent spawn
//! - [`instance`]: per-session state machine and output fan-out
//! - [`store`]: persisted snapshots and crash-recovery reload
//! - [`sink`]: setup tee and the resilient finish/check writer
//! - [`supervisor`]: registry, request dispatch, the start pipeline
//! - [`server`]: Unix-socket accept loop

pub mod container;
pub mod error;
pub mod instance;
pub mod project;
pub mod pty;
pub mod server;
pub mod sink;
pub mod store;
pub mod supervisor;

pub use error::{GroveError, Result};
pub use supervisor::Supervisor;
