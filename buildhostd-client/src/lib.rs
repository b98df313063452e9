//! buildhost client library.
//!
//! Runs builds on a shared build server node (starting one when needed) and
//! single tasks in throwaway task-host processes.

pub mod client;
pub mod launcher;
pub mod task_host;

pub use client::{BuildClient, BuildRequest, ClientExitType, ClientOutcome, ClientState};
pub use launcher::{find_binary, HostSpawner, LaunchError, ProcessLauncher, ServerLauncher};
pub use task_host::{TaskHostFailure, TaskHostLauncher};
