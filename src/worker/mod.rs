//! Command execution.
//!
//! All hardware access flows through one queue:
//!
//! ```text
//! API layer ──┐
//!             ├─► TaskSender ─► [ unbounded FIFO ] ─► CommandWorker ─► devices
//! MonitorTicker┘                                          │
//!                                                         ├─► MeasurementStore
//!                                                         └─► ActionLogStore
//! ```
//!
//! The single [`CommandWorker`] guarantees at most one in-flight device call
//! system-wide. Producers never touch hardware and never wait on it.

pub mod combine;
pub mod queue;
pub mod task;
pub mod ticker;
#[allow(clippy::module_inception)]
pub mod worker;

pub use combine::merge_donor;
pub use queue::{task_queue, TaskReceiver, TaskSender};
pub use task::{CommandKind, CompletedTask, Task, TaskOutcome};
pub use ticker::MonitorTicker;
pub use worker::CommandWorker;
