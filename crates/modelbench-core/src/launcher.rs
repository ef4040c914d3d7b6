//! Starts test scripts as child processes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::config::ServiceConfig;
use crate::domain::JobId;
use crate::error::{Result, RunError};

/// A freshly spawned script with its output pipes detached from the child
/// handle so they can be drained independently.
///
/// Being returned a `LaunchedProcess` does not mean the run succeeded; the
/// process may still fail while running.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub job_id: JobId,
    pub script_path: PathBuf,
    pub pid: Option<u32>,
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Launches `<interpreter> <script>` in a fixed working directory.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    interpreter: PathBuf,
    work_dir: PathBuf,
    env: BTreeMap<String, String>,
}

impl ProcessLauncher {
    pub fn new(interpreter: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            work_dir: work_dir.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            interpreter: config.interpreter_path(),
            work_dir: config.work_dir_path(),
            env: config.env.clone(),
        }
    }

    /// Add an environment variable for every launched process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Spawn the interpreter on `script_path` with unbuffered output.
    ///
    /// A missing script is reported as [`RunError::SpawnFailed`] rather than
    /// left to the interpreter, so it never shows up as a completed run.
    /// `script_path` must be absolute: the child resolves it from `work_dir`.
    pub async fn launch(&self, job_id: &JobId, script_path: &Path) -> Result<LaunchedProcess> {
        let script_path = script_path.to_path_buf();
        let is_file = tokio::fs::metadata(&script_path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(self.spawn_failed(&script_path, "script not found"));
        }

        let mut command = Command::new(&self.interpreter);
        command
            .arg(&script_path)
            .current_dir(&self.work_dir)
            .env("PYTHONUNBUFFERED", "1")
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| self.spawn_failed(&script_path, e))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            return Err(self.spawn_failed(&script_path, "output pipes unavailable"));
        };

        Ok(LaunchedProcess {
            job_id: job_id.clone(),
            pid: child.id(),
            script_path,
            child,
            stdout,
            stderr,
        })
    }

    fn spawn_failed(&self, script: &Path, reason: impl ToString) -> RunError {
        RunError::SpawnFailed {
            interpreter: self.interpreter.clone(),
            script: script.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_launch_runs_in_work_dir_with_unbuffered_env() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "env.sh",
            "pwd\necho \"$PYTHONUNBUFFERED\"\necho \"$MODELBENCH_EXTRA\"\n",
        );
        let launcher = ProcessLauncher::new("/bin/sh", dir.path()).with_env("MODELBENCH_EXTRA", "yes");

        let mut launched = launcher
            .launch(&JobId::from("v1-knn-1"), &script)
            .await
            .expect("launch");
        assert!(launched.pid.is_some());

        let mut out = String::new();
        launched.stdout.read_to_string(&mut out).await.unwrap();
        let status = launched.child.wait().await.unwrap();
        assert!(status.success());

        let lines: Vec<_> = out.lines().collect();
        let expected_dir = dir.path().canonicalize().unwrap();
        assert_eq!(Path::new(lines[0]).canonicalize().unwrap(), expected_dir);
        assert_eq!(lines[1], "1");
        assert_eq!(lines[2], "yes");
    }

    #[tokio::test]
    async fn test_missing_script_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new("/bin/sh", dir.path());
        let err = launcher
            .launch(&JobId::from("v9-knn-1"), &dir.path().join("tests/v9/test_knn.py"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::SpawnFailed { .. }));
        assert!(err.to_string().contains("script not found"));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "ok.sh", "exit 0\n");
        let launcher = ProcessLauncher::new(dir.path().join("venv/bin/python3"), dir.path());
        let err = launcher
            .launch(&JobId::from("v1-knn-1"), &script)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::SpawnFailed { .. }));
    }

    #[test]
    fn test_from_config_uses_venv_interpreter() {
        let config = ServiceConfig::with_project_root("/srv/ml");
        let launcher = ProcessLauncher::from_config(&config);
        assert_eq!(launcher.interpreter(), Path::new("/srv/ml/venv/bin/python3"));
        assert_eq!(launcher.work_dir(), Path::new("/srv/ml"));
    }
}
