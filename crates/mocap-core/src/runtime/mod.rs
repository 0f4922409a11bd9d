//! Job execution: process supervision, the stage chain, stop requests,
//! progress throttling and orphan recovery.

pub mod artifact;
pub mod cancel;
pub mod executor;
pub mod probe;
pub mod protocol;
pub mod recovery;
pub mod registry;
pub mod service;
pub mod stop;
pub mod supervisor;
pub mod throttle;
pub mod workspace;

pub use cancel::StopAck;
pub use executor::Resume;
pub use recovery::RecoveryReport;
pub use service::{JobService, NewJob, ServiceParts};
pub use workspace::Workspace;
