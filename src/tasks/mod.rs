//! Task Orchestrator: workflows, pacing, retry and persisted task records.

pub mod locks;
pub mod orchestrator;
pub mod outcome;
pub mod pacing;
pub mod record;
pub mod retry;
pub mod scheduler;
pub mod workflows;

pub use orchestrator::{Orchestrator, ProgressEvent, TaskRun, WorkflowRequest};
pub use outcome::{FailureKind, Outcome};
pub use pacing::{CancelToken, Pacer, TokioPacer};
pub use record::{TaskRecord, TaskStatus, TaskStore, WorkflowKind};
pub use scheduler::{DeferredJob, DeferredQueue, Scheduler};
pub use workflows::enroll::EnrollRequest;
pub use workflows::verify::VerifyCredential;
