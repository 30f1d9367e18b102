//! Asynchronous Tasks
//!
//! - [`catalogue`]: registrable resource and telemetry kinds
//! - [`dispatcher`]: fire-and-forget delivery of task messages
//! - [`executor`]: in-process consumer of the task queue

pub mod catalogue;
pub mod dispatcher;
pub mod executor;

pub use catalogue::{KindCatalogue, ResourceKind, TelemetryKind};
pub use dispatcher::{ChannelDispatcher, TaskConfig, TaskMessage};
pub use executor::TaskExecutor;
