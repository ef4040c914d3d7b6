//! Relays a running script's stdout and stderr as `test-output` events.
//!
//! Both pipes are drained concurrently with the exit wait, so a script that
//! fills one pipe never stalls on the other. Chunks of one pipe are
//! forwarded in the order they were read; there is no ordering between the
//! two pipes.

use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::domain::{JobId, OutputStream, RunEvent, ServerEvent};
use crate::error::RunError;
use crate::launcher::LaunchedProcess;
use crate::metrics::METRICS;

/// Size of a single pipe read.
pub const READ_CHUNK: usize = 8 * 1024;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The process exited. Signal deaths report `-1`.
    Exited { exit_code: i32 },
    /// Waiting on or reading from the process failed.
    Failed { error: String },
}

impl Termination {
    fn process_error(context: &str, e: &std::io::Error) -> Self {
        Termination::Failed {
            error: RunError::Process(format!("{context}: {e}")).to_string(),
        }
    }
}

/// Summary of one drained run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub job_id: JobId,
    pub termination: Termination,
    pub stdout_chunks: u64,
    pub stderr_chunks: u64,
    pub duration_ms: u64,
    /// The run was stopped through its kill signal.
    pub killed: bool,
}

impl RunOutcome {
    /// A run that never got as far as draining output.
    pub fn spawn_failed(job_id: JobId, error: impl Into<String>) -> Self {
        Self {
            job_id,
            termination: Termination::Failed {
                error: error.into(),
            },
            stdout_chunks: 0,
            stderr_chunks: 0,
            duration_ms: 0,
            killed: false,
        }
    }

    /// Exited with code 0.
    pub fn success(&self) -> bool {
        matches!(self.termination, Termination::Exited { exit_code: 0 })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited { exit_code } => Some(exit_code),
            Termination::Failed { .. } => None,
        }
    }

    /// `Completed` for any exit, `Failed` otherwise.
    pub fn terminal_event(&self) -> RunEvent {
        match &self.termination {
            Termination::Exited { exit_code } => RunEvent::completed(&self.job_id, *exit_code),
            Termination::Failed { error } => RunEvent::failed(&self.job_id, error.clone()),
        }
    }
}

/// Forwards a launched process's output into a session's event channel.
#[derive(Debug, Clone)]
pub struct OutputMultiplexer {
    sink: mpsc::Sender<ServerEvent>,
}

impl OutputMultiplexer {
    pub fn new(sink: mpsc::Sender<ServerEvent>) -> Self {
        Self { sink }
    }

    /// Drain both pipes and wait for exit. A message on `kill` kills the
    /// process; draining continues until the pipes close.
    ///
    /// Does not emit the terminal event: the caller untracks the run first
    /// and then sends [`RunOutcome::terminal_event`].
    pub async fn drain(&self, process: LaunchedProcess, kill: oneshot::Receiver<()>) -> RunOutcome {
        let LaunchedProcess {
            job_id,
            mut child,
            stdout,
            stderr,
            ..
        } = process;
        let started = Instant::now();
        let mut killed = false;

        let wait = async {
            tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill => {
                    debug!(job_id = %job_id, "kill requested");
                    killed = true;
                    match child.start_kill() {
                        Ok(()) => child.wait().await,
                        Err(e) => Err(e),
                    }
                }
            }
        };

        let (stdout_chunks, stderr_chunks, status) = tokio::join!(
            self.pump(stdout, OutputStream::Stdout, &job_id),
            self.pump(stderr, OutputStream::Stderr, &job_id),
            wait,
        );

        let termination = match (status, &stdout_chunks, &stderr_chunks) {
            (Err(e), _, _) => Termination::process_error("failed to wait for process", &e),
            (Ok(_), Err(e), _) => Termination::process_error("failed to read stdout", e),
            (Ok(_), _, Err(e)) => Termination::process_error("failed to read stderr", e),
            (Ok(status), Ok(_), Ok(_)) => Termination::Exited {
                exit_code: status.code().unwrap_or(-1),
            },
        };

        RunOutcome {
            job_id,
            termination,
            stdout_chunks: stdout_chunks.unwrap_or(0),
            stderr_chunks: stderr_chunks.unwrap_or(0),
            duration_ms: started.elapsed().as_millis() as u64,
            killed,
        }
    }

    /// Read one pipe to EOF, forwarding each decoded chunk.
    ///
    /// Once the receiving side is gone, chunks are read and dropped so the
    /// child can run to completion.
    async fn pump<R>(&self, mut reader: R, stream: OutputStream, job_id: &JobId) -> std::io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut decoder = Utf8Carry::default();
        let mut chunks = 0u64;
        let mut detached = false;

        loop {
            let n = reader.read(&mut buf).await?;
            let text = if n == 0 {
                decoder.finish()
            } else {
                decoder.push(&buf[..n])
            };

            if let Some(text) = text {
                chunks += 1;
                METRICS.inc_output_chunks();
                if !detached {
                    let event = RunEvent::output(job_id, stream, text).into();
                    if self.sink.send(event).await.is_err() {
                        detached = true;
                        warn!(
                            job_id = %job_id,
                            stream = stream.as_str(),
                            "session gone, discarding further output"
                        );
                    }
                }
            }

            if n == 0 {
                return Ok(chunks);
            }
        }
    }
}

/// Lossy UTF-8 decoding that holds back a multi-byte sequence split across
/// two reads until the rest of it arrives.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let split = self.pending.len() - incomplete_tail(&self.pending);
        if split == 0 {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        Some(text)
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

/// Length of a trailing UTF-8 sequence that is started but not complete.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}
