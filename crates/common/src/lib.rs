// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod config;
pub mod engine;
pub mod logging;
pub mod named_lock;
pub mod process_scope;

pub use config::{EnvSwitches, Settings};
pub use engine::{
    BuildContext, BuildEngine, BuildOutcome, CommandBuildEngine, ConsoleSink, ConsoleStream,
    ExitType, StdConsole,
};
pub use named_lock::{LockError, LockScope, NamedLock, ServerLocks, ServerStatus};
pub use process_scope::{park_in, ProcessContextScope};
