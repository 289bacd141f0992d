//! Optional mirroring of queue activity to an external task registry
//!
//! The registry is strictly best-effort: every call goes through
//! [`RemoteReporter`], which never blocks and never fails the caller.
//! Producers mirror task creation by enqueuing through [`MirroredTaskStore`].

mod mirror;
mod registry;
mod reporter;

pub use mirror::MirroredTaskStore;
pub use registry::{HttpTaskRegistry, RegisteredTask, RegistryError, TaskRegistry};
pub use reporter::{RegistryEvent, RemoteReporter, ReporterStats, DEFAULT_REPORTER_CAPACITY};
