//! Domain types: run requests, job ids and run events.

pub mod event;
pub mod job_id;
pub mod request;

pub use event::{
    OutputStream, Rejection, RunCompleted, RunEvent, RunFailed, RunOutput, RunStarted, ServerEvent,
};
pub use job_id::{JobId, JobIdAllocator};
pub use request::RunRequest;
