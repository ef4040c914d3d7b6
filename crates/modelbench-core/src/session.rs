//! Per-connection session state machine.
//!
//! ```text
//! Idle --run-test--> Resolving --ok--> Launching --spawned--> Streaming --exit--> Idle
//!                        |                 |
//!                        +--rejected--> Idle  +--spawn failed--> Idle
//! any --transport closed--> Closed
//! ```
//!
//! Runs outlive their session: closing only stops delivery, unless the
//! service is configured to kill on disconnect.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinError;
use tracing::{debug, error, Instrument};
use uuid::Uuid;

use crate::config::BusyPolicy;
use crate::domain::{JobId, RunEvent, RunRequest, ServerEvent};
use crate::metrics::METRICS;
use crate::multiplexer::RunOutcome;
use crate::obs;
use crate::service::{Launch, RunService};

/// Where a session is in its request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Resolving,
    Launching,
    Streaming,
    Closed,
}

/// A message received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    RunTest(RunRequest),
    /// Anything that is not a well-formed command; answered with `error`.
    Malformed(String),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ClientCommand {
    /// Parse a `{"event": "run-test", "data": {...}}` text frame.
    pub fn parse(text: &str) -> Self {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => return ClientCommand::Malformed(format!("malformed message: {e}")),
        };
        match envelope.event.as_str() {
            "run-test" => match serde_json::from_value(envelope.data) {
                Ok(request) => ClientCommand::RunTest(request),
                Err(e) => ClientCommand::Malformed(format!("malformed run-test request: {e}")),
            },
            other => ClientCommand::Malformed(format!("unsupported event: {other}")),
        }
    }
}

type Finished = BoxFuture<'static, (JobId, Result<RunOutcome, JoinError>)>;

/// One client's session: turns commands into runs and tracks which of its
/// runs are still streaming.
pub struct Session {
    id: String,
    service: Arc<RunService>,
    outbound: mpsc::Sender<ServerEvent>,
    state: SessionState,
    active: Vec<JobId>,
    finished: FuturesUnordered<Finished>,
}

impl Session {
    /// Open a session whose events are delivered to `outbound`.
    pub fn new(service: Arc<RunService>, outbound: mpsc::Sender<ServerEvent>) -> Self {
        let id = Uuid::new_v4().to_string();
        obs::emit_session_opened(&id);
        Self {
            id,
            service,
            outbound,
            state: SessionState::Idle,
            active: Vec::new(),
            finished: FuturesUnordered::new(),
        }
    }

    /// Open a session with its own outbound channel, bounded by the
    /// service's `output_buffer`.
    pub fn open(service: Arc<RunService>) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(service.config().output_buffer);
        (Self::new(service, tx), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Jobs started by this session that have not finished yet.
    pub fn active_jobs(&self) -> &[JobId] {
        &self.active
    }

    /// Handle one client command to completion of its launch step.
    pub async fn handle(&mut self, command: ClientCommand) {
        if self.state == SessionState::Closed {
            return;
        }
        match command {
            ClientCommand::Malformed(message) => self.reject(message).await,
            ClientCommand::RunTest(request) => self.run_test(request).await,
        }
    }

    async fn run_test(&mut self, request: RunRequest) {
        self.reap_finished();
        if self.state == SessionState::Streaming
            && self.service.config().busy_policy == BusyPolicy::Reject
        {
            let running = self
                .active
                .first()
                .map(JobId::to_string)
                .unwrap_or_default();
            self.reject(format!("A test is already running in this session: {running}"))
                .await;
            return;
        }

        self.state = SessionState::Resolving;
        let prepared = match self.service.prepare(request) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.settle();
                self.reject(e.to_string()).await;
                return;
            }
        };

        self.state = SessionState::Launching;
        match self.service.start(prepared, self.outbound.clone()).await {
            Launch::Running { job_id, supervisor } => {
                self.active.push(job_id.clone());
                self.finished
                    .push(supervisor.map(move |result| (job_id, result)).boxed());
            }
            Launch::Failed(outcome) => {
                debug!(session_id = %self.id, job_id = %outcome.job_id, "launch failed");
            }
        }
        self.settle();
    }

    /// Record that one of this session's runs reached its terminal event.
    pub fn finish(&mut self, job_id: JobId, result: Result<RunOutcome, JoinError>) {
        if let Err(e) = result {
            error!(session_id = %self.id, job_id = %job_id, error = %e, "run supervisor aborted");
            // The supervisor died before untracking its run or sending its
            // terminal event.
            self.service.registry().unregister(&job_id);
            METRICS.inc_runs_failed();
            let failed = RunEvent::failed(&job_id, format!("run supervisor aborted: {e}"));
            self.send_detached(failed.into());
        }
        self.active.retain(|active| active != &job_id);
        if self.state != SessionState::Closed {
            self.settle();
        }
    }

    /// Wait for the next of this session's runs to finish. Pending forever
    /// when nothing is running.
    pub async fn next_finished(&mut self) -> (JobId, Result<RunOutcome, JoinError>) {
        match self.finished.next().await {
            Some(done) => done,
            None => futures::future::pending().await,
        }
    }

    /// Transport closed. In-flight runs keep going without a listener
    /// unless the service kills on disconnect.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.reap_finished();
        self.state = SessionState::Closed;
        if self.service.config().kill_on_disconnect {
            for job_id in &self.active {
                if self.service.registry().terminate(job_id) {
                    debug!(session_id = %self.id, job_id = %job_id, "terminated on disconnect");
                }
            }
        }
        obs::emit_session_closed(&self.id, self.active.len());
    }

    /// Run the session until `inbound` ends, then close it.
    pub async fn drive<S>(mut self, mut inbound: S) -> SessionState
    where
        S: Stream<Item = ClientCommand> + Unpin,
    {
        let span = obs::session_span(&self.id);
        async {
            loop {
                tokio::select! {
                    command = inbound.next() => match command {
                        Some(command) => self.handle(command).await,
                        None => break,
                    },
                    (job_id, result) = self.next_finished() => self.finish(job_id, result),
                }
            }
            self.close();
        }
        .instrument(span)
        .await;
        self.state
    }

    async fn reject(&mut self, message: String) {
        obs::emit_run_rejected(&self.id, &message);
        METRICS.inc_requests_rejected();
        let _ = self.outbound.send(ServerEvent::rejected(message)).await;
    }

    /// Queue `event` without blocking; a full channel hands it to a task.
    fn send_detached(&self, event: ServerEvent) {
        match self.outbound.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let _ = outbound.send(event).await;
                });
            }
        }
    }

    /// Collect runs that already finished without waiting.
    fn reap_finished(&mut self) {
        while let Some(Some((job_id, result))) = self.finished.next().now_or_never() {
            self.finish(job_id, result);
        }
    }

    fn settle(&mut self) {
        self.state = if self.active.is_empty() {
            SessionState::Idle
        } else {
            SessionState::Streaming
        };
    }
}
