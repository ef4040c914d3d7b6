//! The run service: validates requests, launches scripts and supervises
//! them until their terminal event.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{warn, Instrument};

use crate::config::ServiceConfig;
use crate::domain::{JobId, JobIdAllocator, RunEvent, RunRequest, ServerEvent};
use crate::error::Result;
use crate::launcher::{LaunchedProcess, ProcessLauncher};
use crate::metrics::METRICS;
use crate::multiplexer::{OutputMultiplexer, RunOutcome};
use crate::obs;
use crate::registry::{RunHandle, RunRegistry};
use crate::resolver::ScriptResolver;

/// An accepted request with its job id and script path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRun {
    pub job_id: JobId,
    pub request: RunRequest,
    pub script_path: PathBuf,
}

/// Result of trying to launch a prepared run.
#[derive(Debug)]
pub enum Launch {
    /// The script is running; the handle resolves once its terminal event
    /// has been sent.
    Running {
        job_id: JobId,
        supervisor: JoinHandle<RunOutcome>,
    },
    /// The script never started; `Failed` has already been sent.
    Failed(RunOutcome),
}

/// Process-wide status served by `/api/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub running_tests: usize,
    pub ml_project_path: String,
}

/// Owns the resolver, id allocator, launcher and run registry for the
/// lifetime of the server.
#[derive(Debug)]
pub struct RunService {
    config: ServiceConfig,
    resolver: ScriptResolver,
    launcher: ProcessLauncher,
    ids: JobIdAllocator,
    registry: Arc<RunRegistry>,
}

impl RunService {
    /// Validate `config` and anchor its paths to the current directory.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let config = config.resolve_paths()?;
        Ok(Self {
            resolver: ScriptResolver::new(config.project_root.clone(), config.models.clone()),
            launcher: ProcessLauncher::from_config(&config),
            ids: JobIdAllocator::new(),
            registry: Arc::new(RunRegistry::new()),
            config,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn resolver(&self) -> &ScriptResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Validate and resolve a request, then mint its job id. Rejected
    /// requests never get an id.
    pub fn prepare(&self, request: RunRequest) -> Result<PreparedRun> {
        let script_path = self.resolver.script_path(&request)?;
        let job_id = self.ids.next(&request);
        Ok(PreparedRun {
            job_id,
            request,
            script_path,
        })
    }

    /// Send `test-started`, launch the script and hand it to a supervisor
    /// task that streams its output into `sink`.
    ///
    /// The run is registered before any output is forwarded and
    /// unregistered before its terminal event is sent.
    pub async fn start(self: &Arc<Self>, prepared: PreparedRun, sink: mpsc::Sender<ServerEvent>) -> Launch {
        let PreparedRun {
            job_id,
            request,
            script_path,
        } = prepared;
        let span = obs::run_span(job_id.as_str());

        let started = RunEvent::started(&job_id, &request.version, &request.model, &script_path);
        let _ = sink.send(started.into()).await;
        METRICS.inc_runs_started();

        let process = match self.launcher.launch(&job_id, &script_path).instrument(span.clone()).await {
            Ok(process) => process,
            Err(e) => {
                obs::emit_spawn_failed(job_id.as_str(), &e);
                return Launch::Failed(self.fail_before_streaming(job_id, e.to_string(), &sink).await);
            }
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        let handle = RunHandle::new(job_id.clone(), process.script_path.clone(), process.pid, kill_tx);
        if let Err(e) = self.registry.register(handle) {
            warn!(job_id = %job_id, error = %e, "refusing to supervise untracked run");
            discard(process).await;
            return Launch::Failed(self.fail_before_streaming(job_id, e.to_string(), &sink).await);
        }
        obs::emit_run_started(job_id.as_str(), &script_path.display().to_string(), process.pid);

        let service = Arc::clone(self);
        let supervisor = tokio::spawn(
            async move { service.supervise(process, kill_rx, sink).await }.instrument(span),
        );
        Launch::Running { job_id, supervisor }
    }

    async fn supervise(
        &self,
        process: LaunchedProcess,
        kill: oneshot::Receiver<()>,
        sink: mpsc::Sender<ServerEvent>,
    ) -> RunOutcome {
        let outcome = OutputMultiplexer::new(sink.clone())
            .drain(process, kill)
            .await;

        self.registry.unregister(&outcome.job_id);
        self.record_finish(&outcome);
        let _ = sink.send(outcome.terminal_event().into()).await;
        outcome
    }

    async fn fail_before_streaming(
        &self,
        job_id: JobId,
        error: String,
        sink: &mpsc::Sender<ServerEvent>,
    ) -> RunOutcome {
        let outcome = RunOutcome::spawn_failed(job_id, error);
        self.record_finish(&outcome);
        let _ = sink.send(outcome.terminal_event().into()).await;
        outcome
    }

    fn record_finish(&self, outcome: &RunOutcome) {
        match outcome.exit_code() {
            Some(_) => METRICS.inc_runs_completed(),
            None => METRICS.inc_runs_failed(),
        }
        obs::emit_run_finished(
            outcome.job_id.as_str(),
            outcome.exit_code(),
            outcome.duration_ms,
            outcome.success(),
        );
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            status: "ok".to_string(),
            running_tests: self.registry.size(),
            ml_project_path: self.resolver.project_root().display().to_string(),
        }
    }
}

/// Kill and reap a process that will not be supervised.
async fn discard(mut process: LaunchedProcess) {
    let _ = process.child.start_kill();
    let _ = process.child.wait().await;
}
