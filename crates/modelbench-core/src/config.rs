//! Service configuration.
//!
//! Every field has a default so a TOML file only needs to name what it
//! overrides:
//!
//! ```toml
//! project_root = "/srv/ml-project"
//! interpreter = "/usr/bin/python3"
//! output_buffer = 512
//! busy_policy = "allow"
//!
//! [models]
//! knn = "test_knn.py"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunError};

/// Project checkout the test scripts live in.
pub const DEFAULT_PROJECT_ROOT: &str = "/root/Project/ML-based-Threat-aware-Auto-scaling-in-Kubernetes";

/// Default number of events buffered between a run's output readers and
/// the session writer before the readers wait.
pub const DEFAULT_OUTPUT_BUFFER: usize = 256;

/// What a session does with a run request while one of its runs is still streaming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Reject the request with an `error` event naming the active job.
    #[default]
    Reject,
    /// Start another run; its events are told apart by job id only.
    Allow,
}

/// Configuration consumed by [`crate::service::RunService`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root of the ML project; scripts resolve to `<root>/tests/<version>/<script>`.
    pub project_root: PathBuf,

    /// Interpreter binary. Defaults to `<root>/venv/bin/python3`.
    pub interpreter: Option<PathBuf>,

    /// Working directory of launched scripts. Defaults to `project_root`.
    pub work_dir: Option<PathBuf>,

    /// Model name to script filename. Several names may share one script.
    pub models: BTreeMap<String, String>,

    /// Extra environment variables for launched scripts.
    pub env: BTreeMap<String, String>,

    /// Bound of the per-session outbound event channel.
    pub output_buffer: usize,

    pub busy_policy: BusyPolicy,

    /// Terminate a session's in-flight runs when its transport closes.
    pub kill_on_disconnect: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from(DEFAULT_PROJECT_ROOT),
            interpreter: None,
            work_dir: None,
            models: default_models(),
            env: BTreeMap::new(),
            output_buffer: DEFAULT_OUTPUT_BUFFER,
            busy_policy: BusyPolicy::default(),
            kill_on_disconnect: false,
        }
    }
}

/// The dashboard's model catalogue.
pub fn default_models() -> BTreeMap<String, String> {
    [
        ("knn", "test_knn.py"),
        ("isolation_forest", "test_isolation_forest.py"),
        ("ocsvm", "test_one_class_svm.py"),
        ("one_class_svm", "test_one_class_svm.py"),
        ("gmm", "test_gmm.py"),
        ("autoencoder", "test_autoencoder.py"),
    ]
    .into_iter()
    .map(|(model, script)| (model.to_string(), script.to_string()))
    .collect()
}

impl ServiceConfig {
    /// Config rooted at `project_root`, everything else default.
    pub fn with_project_root(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document and validate it.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: ServiceConfig =
            toml::from_str(raw).map_err(|e| RunError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RunError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(RunError::Config("model map must not be empty".to_string()));
        }
        if let Some((model, _)) = self.models.iter().find(|(_, script)| script.trim().is_empty()) {
            return Err(RunError::Config(format!(
                "model {model} maps to an empty script name"
            )));
        }
        if self.output_buffer == 0 {
            return Err(RunError::Config(
                "output_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Anchor `project_root`, `work_dir` and a path-like `interpreter` to the
    /// current directory. A bare interpreter name such as `python3` is left
    /// for `PATH` lookup.
    ///
    /// Launched scripts run in `work_dir`, so every path handed to them
    /// must already be absolute.
    pub fn resolve_paths(mut self) -> Result<Self> {
        self.project_root = std::path::absolute(&self.project_root)?;
        if let Some(work_dir) = self.work_dir.take() {
            self.work_dir = Some(std::path::absolute(work_dir)?);
        }
        if let Some(interpreter) = self.interpreter.take() {
            self.interpreter = Some(if interpreter.components().count() > 1 {
                std::path::absolute(interpreter)?
            } else {
                interpreter
            });
        }
        Ok(self)
    }

    /// Interpreter to invoke, resolving the venv default.
    pub fn interpreter_path(&self) -> PathBuf {
        self.interpreter
            .clone()
            .unwrap_or_else(|| self.project_root.join("venv").join("bin").join("python3"))
    }

    /// Working directory for launched scripts.
    pub fn work_dir_path(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| self.project_root.clone())
    }
}
