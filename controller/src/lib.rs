pub mod conditions;
pub mod config;
pub mod duration;
pub mod error;
pub mod events;
pub mod filters;
pub mod metrics;
pub mod orchestrator;
pub mod pacer;
pub mod telemetry;
pub mod watch;

pub use crate::orchestrator::{DrainOrchestrator, NodeEvent, ScheduledDrain};
pub use crate::watch::NodeWatcher;
