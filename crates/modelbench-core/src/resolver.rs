//! Maps (dataset version, model) requests to test script paths.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::domain::RunRequest;
use crate::error::{Result, RunError};

/// Directory under the project root holding per-version test scripts.
pub const TESTS_DIR: &str = "tests";

/// Resolves model names against a fixed model-to-script map.
#[derive(Debug, Clone)]
pub struct ScriptResolver {
    project_root: PathBuf,
    models: BTreeMap<String, String>,
}

impl ScriptResolver {
    pub fn new(project_root: impl Into<PathBuf>, models: BTreeMap<String, String>) -> Self {
        Self {
            project_root: project_root.into(),
            models,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Script filename for `model`.
    pub fn resolve(&self, model: &str) -> Result<&str> {
        self.models
            .get(model)
            .map(String::as_str)
            .ok_or_else(|| RunError::UnknownModel(model.to_string()))
    }

    /// `<root>/tests/<version>/<script>` for a validated request.
    ///
    /// The version is not checked against what exists on disk; an unknown
    /// version fails when the script is launched.
    pub fn script_path(&self, request: &RunRequest) -> Result<PathBuf> {
        request.validate()?;
        let script = self.resolve(&request.model)?;
        Ok(self
            .project_root
            .join(TESTS_DIR)
            .join(&request.version)
            .join(script))
    }

    /// Known model names, sorted.
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}
