//! Measurement pipeline.
//!
//! Ties the building blocks in `joulegate-core` into the per-request flow:
//!
//! - [`MeasurementPipeline`] runs one request from validation to a terminal
//!   task state.
//! - [`TrialOrchestrator`] drives warmup and measured trials under the
//!   stopping rule.
//! - [`TaskRegistry`] owns task records and publishes lifecycle events on
//!   an [`EventBus`].
//! - [`ReadinessProbe`] answers whether this host can measure right now.

pub mod coordinator;
pub mod events;
pub mod orchestrator;
pub mod readiness;
pub mod registry;

pub use coordinator::{MeasurementPipeline, PipelineConfig};
pub use events::{EventBus, TaskEvent};
pub use orchestrator::{TrialOrchestrator, TrialPhase, TrialRun};
pub use readiness::{ReadinessProbe, ReadinessReport};
pub use registry::TaskRegistry;
