//! modelbenchd - test runner daemon for the anomaly-detection dashboard
//!
//! Serves the run-test WebSocket session at `/ws` and a small JSON API
//! (`/api/health`, `/api/runs`, `/api/run-test`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use modelbench_core::{init_tracing, BusyPolicy, RunService, ServiceConfig, METRICS};
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "modelbenchd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Launch model test scripts and stream their output", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "MODELBENCH_BIND", default_value = "0.0.0.0:3001")]
    bind: SocketAddr,

    /// TOML configuration file
    #[arg(short, long, env = "MODELBENCH_CONFIG")]
    config: Option<PathBuf>,

    /// Root of the ML project (overrides the config file)
    #[arg(long, env = "MODELBENCH_PROJECT_ROOT")]
    project_root: Option<PathBuf>,

    /// Interpreter used to run test scripts
    #[arg(long)]
    interpreter: Option<PathBuf>,

    /// Terminate a session's runs when its connection closes
    #[arg(long)]
    kill_on_disconnect: bool,

    /// Let one session run several tests at once
    #[arg(long)]
    allow_concurrent_runs: bool,

    /// Events buffered per session before output readers wait
    #[arg(long)]
    output_buffer: Option<usize>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn service_config(&self) -> Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => ServiceConfig::default(),
        };
        if let Some(root) = &self.project_root {
            config.project_root = root.clone();
        }
        if let Some(interpreter) = &self.interpreter {
            config.interpreter = Some(interpreter.clone());
        }
        if let Some(buffer) = self.output_buffer {
            config.output_buffer = buffer;
        }
        if self.kill_on_disconnect {
            config.kill_on_disconnect = true;
        }
        if self.allow_concurrent_runs {
            config.busy_policy = BusyPolicy::Allow;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let config = cli.service_config()?;
    let service = Arc::new(RunService::new(config)?);

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("binding {}", cli.bind))?;
    let models: Vec<&str> = service.resolver().models().collect();
    info!(
        version = modelbench_core::VERSION,
        addr = %listener.local_addr()?,
        project_root = %service.resolver().project_root().display(),
        interpreter = %service.config().interpreter_path().display(),
        models = ?models,
        "modelbenchd listening"
    );

    modelbenchd::serve(listener, service, shutdown_signal()).await?;

    METRICS.flush();
    info!("modelbenchd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler failed; serving until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_config_file() {
        let cli = Cli::try_parse_from(["modelbenchd"]).unwrap();
        assert_eq!(cli.bind, "0.0.0.0:3001".parse::<SocketAddr>().unwrap());
        let config = cli.service_config().unwrap();
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modelbench.toml");
        std::fs::write(
            &path,
            "project_root = \"/srv/ml\"\noutput_buffer = 8\n\n[models]\nknn = \"test_knn.py\"\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "modelbenchd",
            "--config",
            path.to_str().unwrap(),
            "--project-root",
            "/opt/ml",
            "--interpreter",
            "/usr/bin/python3",
            "--kill-on-disconnect",
            "--allow-concurrent-runs",
        ])
        .unwrap();
        let config = cli.service_config().unwrap();

        assert_eq!(config.project_root, PathBuf::from("/opt/ml"));
        assert_eq!(config.interpreter, Some(PathBuf::from("/usr/bin/python3")));
        assert_eq!(config.output_buffer, 8);
        assert!(config.kill_on_disconnect);
        assert_eq!(config.busy_policy, BusyPolicy::Allow);
        assert_eq!(config.models.len(), 1);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = Cli::try_parse_from(["modelbenchd", "--config", "/nonexistent/modelbench.toml"])
            .unwrap();
        assert!(cli.service_config().is_err());
    }
}
