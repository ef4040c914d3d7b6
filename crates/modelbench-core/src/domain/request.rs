//! Run requests as sent by a dashboard session.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunError};

/// A request to run one model's test script against one dataset version.
///
/// Missing fields deserialize as empty strings so they fail validation with
/// a readable message instead of a parse error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default, alias = "datasetVersion")]
    pub version: String,

    #[serde(default, alias = "modelName")]
    pub model: String,
}

impl RunRequest {
    pub fn new(version: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            model: model.into(),
        }
    }

    /// Check that both fields are present and the version is usable as a
    /// single path segment.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() || self.model.trim().is_empty() {
            return Err(RunError::InvalidRequest(
                "Version and model are required".to_string(),
            ));
        }
        if self.version.contains(['/', '\\']) || self.version == "." || self.version == ".." {
            return Err(RunError::InvalidRequest(format!(
                "version must be a single path segment: {}",
                self.version
            )));
        }
        Ok(())
    }
}
