//! buildhost server side: the build server node, the task-host node and
//! the pieces they share.

pub mod console;
pub mod node;
pub mod runners;
pub mod task_host;

pub use console::RedirectedConsole;
pub use node::{ServerNode, ServerNodeConfig, ShutdownReason};
pub use runners::{TaskContext, TaskError, TaskLog, TaskOutputs, TaskRegistry, TaskRunner};
pub use task_host::{TaskHostConfig, TaskHostExit, TaskHostNode};
