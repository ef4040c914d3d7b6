//! Run lifecycle events and their wire form.
//!
//! Every event leaves the service as an envelope
//! `{"event": "<name>", "data": {...}}` with camelCase payload fields, the
//! shape the dashboard's terminal popup listens for.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use super::job_id::JobId;

/// Which output pipe of the child a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStarted {
    pub test_id: JobId,
    pub version: String,
    pub model: String,
    pub script_path: String,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutput {
    pub test_id: JobId,
    pub output: String,
    pub stream: OutputStream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCompleted {
    pub test_id: JobId,
    pub exit_code: i32,
    pub success: bool,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailed {
    pub test_id: JobId,
    pub error: String,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
}

/// Events of one run, in delivery order: one `Started`, any number of
/// `Output`, then exactly one of `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Started(RunStarted),
    Output(RunOutput),
    Completed(RunCompleted),
    Failed(RunFailed),
}

impl RunEvent {
    pub fn started(job_id: &JobId, version: &str, model: &str, script_path: &Path) -> Self {
        RunEvent::Started(RunStarted {
            test_id: job_id.clone(),
            version: version.to_string(),
            model: model.to_string(),
            script_path: script_path.display().to_string(),
            timestamp: Utc::now(),
        })
    }

    pub fn output(job_id: &JobId, stream: OutputStream, output: String) -> Self {
        RunEvent::Output(RunOutput {
            test_id: job_id.clone(),
            output,
            stream,
        })
    }

    /// A normal exit; `success` is derived from the exit code.
    pub fn completed(job_id: &JobId, exit_code: i32) -> Self {
        RunEvent::Completed(RunCompleted {
            test_id: job_id.clone(),
            exit_code,
            success: exit_code == 0,
            timestamp: Utc::now(),
        })
    }

    pub fn failed(job_id: &JobId, error: impl Into<String>) -> Self {
        RunEvent::Failed(RunFailed {
            test_id: job_id.clone(),
            error: error.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            RunEvent::Started(e) => &e.test_id,
            RunEvent::Output(e) => &e.test_id,
            RunEvent::Completed(e) => &e.test_id,
            RunEvent::Failed(e) => &e.test_id,
        }
    }

    /// `Completed` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Completed(_) | RunEvent::Failed(_))
    }

    /// Wire event name.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Started(_) => "test-started",
            RunEvent::Output(_) => "test-output",
            RunEvent::Completed(_) => "test-completed",
            RunEvent::Failed(_) => "test-error",
        }
    }
}

/// Payload of a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub message: String,
}

/// Everything a session can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Run(RunEvent),
    /// A request refused before a job id was allocated.
    Rejected(Rejection),
}

impl ServerEvent {
    pub fn rejected(message: impl Into<String>) -> Self {
        ServerEvent::Rejected(Rejection {
            message: message.into(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Run(event) => event.name(),
            ServerEvent::Rejected(_) => "error",
        }
    }

    pub fn as_run(&self) -> Option<&RunEvent> {
        match self {
            ServerEvent::Run(event) => Some(event),
            ServerEvent::Rejected(_) => None,
        }
    }

    /// Serialize to the JSON text sent over the session transport.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<RunEvent> for ServerEvent {
    fn from(event: RunEvent) -> Self {
        ServerEvent::Run(event)
    }
}

impl Serialize for ServerEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut envelope = serializer.serialize_struct("ServerEvent", 2)?;
        envelope.serialize_field("event", self.name())?;
        match self {
            ServerEvent::Run(RunEvent::Started(data)) => envelope.serialize_field("data", data)?,
            ServerEvent::Run(RunEvent::Output(data)) => envelope.serialize_field("data", data)?,
            ServerEvent::Run(RunEvent::Completed(data)) => {
                envelope.serialize_field("data", data)?
            }
            ServerEvent::Run(RunEvent::Failed(data)) => envelope.serialize_field("data", data)?,
            ServerEvent::Rejected(data) => envelope.serialize_field("data", data)?,
        }
        envelope.end()
    }
}

/// RFC 3339 timestamps with millisecond precision and a `Z` suffix.
mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
