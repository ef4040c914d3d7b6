//! End-to-end run lifecycle tests against real child processes.
//!
//! Scripts are plain shell files run with `/bin/sh` standing in for the
//! project's Python interpreter.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use modelbench_core::{
    ClientCommand, Launch, OutputStream, RunEvent, RunRequest, RunService, ServerEvent,
    ServiceConfig, Session, SessionState,
};
use tokio::sync::mpsc;

fn service(root: &Path) -> Arc<RunService> {
    let mut config = ServiceConfig::with_project_root(root);
    config.interpreter = Some("/bin/sh".into());
    Arc::new(RunService::new(config).expect("service"))
}

fn write_test_script(root: &Path, version: &str, name: &str, body: &str) {
    let dir = root.join("tests").join(version);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(name), body).unwrap();
}

/// Run one request through a session and collect every event it produces.
async fn run_to_end(svc: Arc<RunService>, request: RunRequest) -> Vec<ServerEvent> {
    let (session, mut rx) = Session::open(svc);
    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    let driver = tokio::spawn(session.drive(tokio_stream(cmd_rx)));

    cmd_tx.send(ClientCommand::RunTest(request)).await.unwrap();

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let done = match &event {
            ServerEvent::Rejected(_) => true,
            ServerEvent::Run(run) => run.is_terminal(),
        };
        events.push(event);
        if done {
            break;
        }
    }
    drop(cmd_tx);
    assert_eq!(driver.await.unwrap(), SessionState::Closed);
    events
}

fn tokio_stream<T: Send + 'static>(
    mut rx: mpsc::Receiver<T>,
) -> impl futures::Stream<Item = T> + Unpin {
    Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)))
}

fn output_of(events: &[ServerEvent], stream: OutputStream) -> String {
    events
        .iter()
        .filter_map(|e| match e.as_run() {
            Some(RunEvent::Output(o)) if o.stream == stream => Some(o.output.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_knn_run_streams_lines_then_completes() {
    let dir = tempfile::tempdir().unwrap();
    write_test_script(
        dir.path(),
        "v1",
        "test_knn.py",
        "printf 'line1\\n'\nprintf 'line2\\n'\nexit 0\n",
    );

    let events = run_to_end(service(dir.path()), RunRequest::new("v1", "knn")).await;

    let RunEvent::Started(started) = events[0].as_run().expect("run event") else {
        panic!("first event must be test-started");
    };
    assert_eq!(started.version, "v1");
    assert_eq!(started.model, "knn");
    assert!(started.script_path.ends_with("tests/v1/test_knn.py"));

    let stdout = output_of(&events, OutputStream::Stdout);
    let line1 = stdout.find("line1").expect("line1");
    let line2 = stdout.find("line2").expect("line2");
    assert!(line1 < line2);

    let Some(RunEvent::Completed(done)) = events.last().and_then(ServerEvent::as_run) else {
        panic!("last event must be test-completed");
    };
    assert_eq!(done.exit_code, 0);
    assert!(done.success);
    assert!(events
        .iter()
        .filter_map(ServerEvent::as_run)
        .all(|e| e.job_id() == &started.test_id));
}

/// `path` spelled relative to the test process's working directory.
fn relative_to_cwd(path: &Path) -> PathBuf {
    let cwd = std::env::current_dir().unwrap();
    let mut relative: PathBuf = cwd.components().skip(1).map(|_| "..").collect();
    relative.push(path.strip_prefix("/").unwrap());
    relative
}

#[tokio::test]
async fn test_relative_project_root_runs_existing_script() {
    let dir = tempfile::tempdir().unwrap();
    write_test_script(dir.path(), "v1", "test_knn.py", "echo hi\n");
    let root = relative_to_cwd(dir.path());
    assert!(root.is_relative());

    let svc = service(&root);
    assert!(svc.config().project_root.is_absolute());
    let prepared = svc.prepare(RunRequest::new("v1", "knn")).unwrap();
    assert!(prepared.script_path.is_absolute());

    let events = run_to_end(svc, RunRequest::new("v1", "knn")).await;
    let Some(RunEvent::Completed(done)) = events.last().and_then(ServerEvent::as_run) else {
        panic!("expected test-completed, got {:?}", events.last());
    };
    assert_eq!(done.exit_code, 0);
    assert_eq!(output_of(&events, OutputStream::Stdout), "hi\n");
}

#[tokio::test]
async fn test_unknown_model_single_rejection_no_started() {
    let dir = tempfile::tempdir().unwrap();
    let events =
        run_to_end(service(dir.path()), RunRequest::new("v1", "not_a_real_model")).await;

    assert_eq!(events.len(), 1);
    let ServerEvent::Rejected(rejection) = &events[0] else {
        panic!("expected rejection");
    };
    assert!(rejection.message.contains("not_a_real_model"));
}

#[tokio::test]
async fn test_nonexistent_script_started_then_failed() {
    let dir = tempfile::tempdir().unwrap();
    let events = run_to_end(service(dir.path()), RunRequest::new("v7", "autoencoder")).await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].name(), "test-started");
    let Some(RunEvent::Failed(failed)) = events[1].as_run() else {
        panic!("expected test-error, got {:?}", events[1]);
    };
    assert!(failed.error.contains("test_autoencoder.py"));
}

#[tokio::test]
async fn test_exit_codes_reported_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path());

    for code in [0, 1, 3, 42] {
        write_test_script(dir.path(), "v1", "test_gmm.py", &format!("exit {code}\n"));
        let events = run_to_end(svc.clone(), RunRequest::new("v1", "gmm")).await;
        let Some(RunEvent::Completed(done)) = events.last().and_then(ServerEvent::as_run) else {
            panic!("expected test-completed");
        };
        assert_eq!(done.exit_code, code);
        assert_eq!(done.success, code == 0);
    }
}

#[tokio::test]
async fn test_stdout_order_preserved_with_interleaved_stderr() {
    let dir = tempfile::tempdir().unwrap();
    write_test_script(
        dir.path(),
        "v1",
        "test_isolation_forest.py",
        "i=1\nwhile [ $i -le 500 ]; do\n  echo \"out $i\"\n  echo \"err $i\" >&2\n  i=$((i+1))\ndone\n",
    );

    let events =
        run_to_end(service(dir.path()), RunRequest::new("v1", "isolation_forest")).await;

    let expected_out: String = (1..=500).map(|i| format!("out {i}\n")).collect();
    let expected_err: String = (1..=500).map(|i| format!("err {i}\n")).collect();
    assert_eq!(output_of(&events, OutputStream::Stdout), expected_out);
    assert_eq!(output_of(&events, OutputStream::Stderr), expected_err);
}

#[tokio::test]
async fn test_large_output_does_not_stall_with_small_buffer() {
    let dir = tempfile::tempdir().unwrap();
    write_test_script(
        dir.path(),
        "v1",
        "test_knn.py",
        "head -c 300000 /dev/zero | tr '\\0' 'a'\nhead -c 300000 /dev/zero | tr '\\0' 'b' >&2\n",
    );
    let mut config = ServiceConfig::with_project_root(dir.path());
    config.interpreter = Some("/bin/sh".into());
    config.output_buffer = 1;
    let svc = Arc::new(RunService::new(config).unwrap());

    let events = run_to_end(svc, RunRequest::new("v1", "knn")).await;
    assert_eq!(output_of(&events, OutputStream::Stdout).len(), 300_000);
    assert_eq!(output_of(&events, OutputStream::Stderr).len(), 300_000);
    assert_eq!(events.last().unwrap().name(), "test-completed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registry_empty_after_many_concurrent_runs() {
    let dir = tempfile::tempdir().unwrap();
    write_test_script(dir.path(), "v1", "test_knn.py", "echo ok\n");
    write_test_script(dir.path(), "v1", "test_gmm.py", "echo bad >&2\nexit 2\n");
    let svc = service(dir.path());

    let mut supervisors = Vec::new();
    let mut receivers = Vec::new();
    for i in 0..20 {
        let model = if i % 2 == 0 { "knn" } else { "gmm" };
        let version = if i % 5 == 0 { "missing" } else { "v1" };
        let (tx, rx) = mpsc::channel(16);
        receivers.push(rx);
        let prepared = svc.prepare(RunRequest::new(version, model)).unwrap();
        if let Launch::Running { supervisor, .. } = svc.start(prepared, tx).await {
            supervisors.push(supervisor);
        }
    }
    for supervisor in supervisors {
        supervisor.await.unwrap();
    }
    assert_eq!(svc.registry().size(), 0);

    for mut rx in receivers {
        let mut started = 0;
        let mut terminal = 0;
        while let Some(event) = rx.recv().await {
            let run = event.as_run().expect("run event");
            match run {
                RunEvent::Started(_) => started += 1,
                e if e.is_terminal() => terminal += 1,
                _ => assert_eq!(terminal, 0, "output after terminal event"),
            }
        }
        assert_eq!(started, 1);
        assert_eq!(terminal, 1);
    }
}

#[tokio::test]
async fn test_sequential_runs_in_one_session() {
    let dir = tempfile::tempdir().unwrap();
    write_test_script(dir.path(), "v1", "test_knn.py", "echo first\n");
    write_test_script(dir.path(), "v2", "test_knn.py", "echo second\n");
    let svc = service(dir.path());

    let (tx, mut rx) = mpsc::channel(64);
    let mut session = Session::new(svc.clone(), tx);

    for version in ["v1", "v2"] {
        session
            .handle(ClientCommand::RunTest(RunRequest::new(version, "knn")))
            .await;
        assert_eq!(session.state(), SessionState::Streaming);
        let (job_id, result) = session.next_finished().await;
        session.finish(job_id, result);
        assert_eq!(session.state(), SessionState::Idle);
    }

    let mut outputs = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Some(RunEvent::Output(o)) = event.as_run() {
            outputs.push(o.output.clone());
        }
    }
    assert_eq!(outputs.concat(), "first\nsecond\n");
    assert_eq!(svc.registry().size(), 0);
}
