//! modelbench core library
//!
//! Launches per-model test scripts for the anomaly-detection dashboard and
//! streams their console output to client sessions:
//! - [`resolver`] maps (dataset version, model) to a script path
//! - [`launcher`] spawns the interpreter on that script
//! - [`multiplexer`] relays stdout/stderr chunks as events
//! - [`registry`] tracks runs that are still executing
//! - [`service`] and [`session`] tie them together per client connection

pub mod config;
pub mod domain;
pub mod error;
pub mod launcher;
pub mod metrics;
pub mod multiplexer;
pub mod obs;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod session;
pub mod telemetry;

pub use config::{default_models, BusyPolicy, ServiceConfig};
pub use domain::{
    JobId, JobIdAllocator, OutputStream, Rejection, RunCompleted, RunEvent, RunFailed, RunOutput,
    RunRequest, RunStarted, ServerEvent,
};
pub use error::{Result, RunError};
pub use launcher::{LaunchedProcess, ProcessLauncher};
pub use metrics::METRICS;
pub use multiplexer::{OutputMultiplexer, RunOutcome, Termination};
pub use registry::{RunHandle, RunRegistry, RunningJob};
pub use resolver::ScriptResolver;
pub use service::{HealthStatus, Launch, PreparedRun, RunService};
pub use session::{ClientCommand, Session, SessionState};
pub use telemetry::init_tracing;

/// modelbench version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
