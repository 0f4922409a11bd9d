//! Orchestration core of the mocap pipeline service.
//!
//! Jobs turn an input video into a BVH motion file by running a chain of
//! external tools (2D detectors, converters, 3D lifters). This crate owns the
//! job records, supervises the tool processes, handles stop requests and
//! settles jobs left behind by a previous service instance.

pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod runtime;
pub mod store;

pub use config::RuntimeConfig;
pub use error::{ConfigError, PipelineError, ServiceError, StoreError};
pub use model::{JobId, JobRecord, JobStatus, JobView, PipelineKind};
pub use runtime::{JobService, NewJob, RecoveryReport, StopAck};
pub use store::{JobStore, Outcome};
