mod common;

use common::{calls, CountingCompiler, Event, RecordingOutbox};
use fedbuild::command::{self, arg};
use fedbuild::request::BuildRequest;
use fedbuild::runtime::Handler;
use fedbuild::worker::{Phase, Worker, WorkerSettings};
use litemsg::{Message, Node};
use std::path::Path;

fn dispatcher() -> Node {
    Node::new("localhost", 8080)
}

fn repository() -> Node {
    Node::new("localhost", 8081)
}

fn test_node() -> Node {
    Node::new("localhost", 8082)
}

fn client() -> Node {
    Node::new("localhost", 7000)
}

fn settings(base: &Path) -> WorkerSettings {
    WorkerSettings {
        base_dir: base.to_path_buf(),
        dispatcher: dispatcher(),
        repository: repository(),
        test_node: test_node(),
        artifact_extensions: vec![],
    }
}

fn write_request(base: &Path, build_files: &[&str], drivers: &[&str]) {
    let mut req = BuildRequest::default();
    req.client_id = "alice".to_owned();
    req.language = "rust".to_owned();
    req.build_files = build_files.iter().map(|s| s.to_string()).collect();
    req.test_drivers = drivers.iter().map(|s| s.to_string()).collect();
    req.write(base.join("calc.toml")).unwrap();
}

fn build_request() -> Message {
    let mut msg = Message::request(command::BUILDREQUEST, Node::new("localhost", 8090))
        .with_arg(arg::PROJECT, "calc.toml")
        .with_arg(arg::CLIENTDETAILS, client());
    msg.from = dispatcher();
    msg
}

fn reply_from(cmd: &str, from: Node, session: &str) -> Message {
    let mut msg = Message::reply(cmd, Node::new("localhost", 8090)).with_arg(arg::SESSIONID, session);
    msg.from = from;
    msg
}

/// Drives a worker through BUILDREQUEST and returns the session id it picked.
fn accept<C: fedbuild::compiler::Compiler>(
    worker: &mut Worker<C>,
    out: &RecordingOutbox,
) -> String {
    worker.handle(out, build_request()).unwrap();
    assert_eq!(worker.phase(), Phase::AwaitingFiles);
    let session = worker.session_id().unwrap().to_owned();
    out.clear();
    session
}

fn deliver(base: &Path, session: &str, files: &[&str]) {
    for f in files {
        std::fs::write(base.join(session).join(f), b"fn main() {}").unwrap();
    }
}

#[test]
fn build_request_asks_repository_for_every_file() {
    let dir = tempfile::tempdir().unwrap();
    write_request(dir.path(), &["src/calc.rs"], &["src/test_calc.rs"]);
    let out = RecordingOutbox::new(Node::new("localhost", 8090));
    let mut worker = Worker::new(settings(dir.path()), CountingCompiler::default());

    worker.handle(&out, build_request()).unwrap();

    assert_eq!(worker.phase(), Phase::AwaitingFiles);
    let session = worker.session_id().unwrap().to_owned();
    assert!(dir.path().join(&session).join("calc.toml").is_file());

    let fetch = out.posts_of(command::FILEREQUEST);
    assert_eq!(fetch.len(), 1);
    assert_eq!(fetch[0].to, repository());
    assert_eq!(fetch[0].arg(arg::SESSIONID), Some(session.as_str()));
    assert_eq!(
        fetch[0].list(arg::FILECOUNT, arg::FILE),
        vec!["src/calc.rs", "src/test_calc.rs"]
    );
    assert_eq!(out.notifications().len(), 1);
    assert!(out.posts_of(command::READY).is_empty());
}

#[test]
fn missing_file_aborts_without_compiling() {
    let dir = tempfile::tempdir().unwrap();
    write_request(dir.path(), &["a.rs", "b.rs"], &[]);
    let out = RecordingOutbox::new(Node::new("localhost", 8090));
    let mut worker = Worker::new(settings(dir.path()), CountingCompiler::default());
    let session = accept(&mut worker, &out);

    deliver(dir.path(), &session, &["a.rs"]);
    worker
        .handle(&out, reply_from(command::FILEREQUESTCOMPLETE, repository(), &session))
        .unwrap();

    let notes = out.notifications();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains("b.rs"), "{}", notes[0]);
    assert_eq!(calls(worker.compiler()), 0);
    assert_eq!(worker.phase(), Phase::Idle);
    assert!(out.uploads_to(&repository()).is_empty());
    let ready = out.posts_of(command::READY);
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].to, dispatcher());
}

#[test]
fn two_artifacts_mean_two_uploads_before_the_manifest() {
    let dir = tempfile::tempdir().unwrap();
    write_request(dir.path(), &["calc.rs"], &["test_add.rs", "test_sub.rs"]);
    let out = RecordingOutbox::new(Node::new("localhost", 8090));
    let mut worker = Worker::new(settings(dir.path()), CountingCompiler::default());
    let session = accept(&mut worker, &out);

    deliver(dir.path(), &session, &["calc.rs", "test_add.rs", "test_sub.rs"]);
    worker
        .handle(&out, reply_from(command::FILEREQUESTCOMPLETE, repository(), &session))
        .unwrap();

    assert_eq!(calls(worker.compiler()), 2);
    assert_eq!(worker.phase(), Phase::ForwardingToTest);
    let logs = out.uploads_to(&repository());
    assert_eq!(logs.len(), 1);
    let log_name = logs[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(log_name.starts_with("BuildLog_calc_8090_"), "{}", log_name);
    // only the request copy went to the test node so far
    assert_eq!(
        out.uploads_to(&test_node()),
        vec![dir.path().join(&session).join("calc.toml")]
    );
    let exec = out.posts_of(command::EXECTESTCASES);
    assert_eq!(exec.len(), 1);
    assert_eq!(exec[0].arg(arg::SESSIONID), Some(session.as_str()));
    assert_eq!(exec[0].arg(arg::CLIENTDETAILS), Some("localhost:7000"));
    assert!(out.posts_of(command::READY).is_empty());
    out.clear();

    worker
        .handle(&out, reply_from(command::TESTFILEREQUEST, test_node(), &session))
        .unwrap();

    let events = out.events();
    let manifest_at = events
        .iter()
        .position(|e| matches!(e, Event::Post(m) if m.command == command::TESTFILEREQUEST))
        .unwrap();
    let uploads_before = events[..manifest_at]
        .iter()
        .filter(|e| matches!(e, Event::Upload { to, .. } if *to == test_node()))
        .count();
    assert_eq!(uploads_before, 2);

    let manifest = &out.posts_of(command::TESTFILEREQUEST)[0];
    assert_eq!(manifest.to, test_node());
    assert_eq!(manifest.arg(arg::FILECOUNT), Some("2"));
    assert_eq!(manifest.list(arg::FILECOUNT, arg::FILE), vec!["test_add", "test_sub"]);
    assert_eq!(worker.phase(), Phase::Idle);
    match events.last() {
        Some(Event::Post(m)) => assert_eq!(m.command, command::READY),
        other => panic!("expected READY last, got {:?}", other),
    }
}

#[test]
fn manifest_counts_only_successful_uploads() {
    let dir = tempfile::tempdir().unwrap();
    write_request(dir.path(), &[], &["test_add.rs", "test_sub.rs"]);
    let out = RecordingOutbox::new(Node::new("localhost", 8090));
    let mut worker = Worker::new(settings(dir.path()), CountingCompiler::default());
    let session = accept(&mut worker, &out);

    deliver(dir.path(), &session, &["test_add.rs", "test_sub.rs"]);
    worker
        .handle(&out, reply_from(command::FILEREQUESTCOMPLETE, repository(), &session))
        .unwrap();
    std::fs::remove_file(dir.path().join(&session).join("test_add")).unwrap();
    out.clear();

    worker
        .handle(&out, reply_from(command::TESTFILEREQUEST, test_node(), &session))
        .unwrap();

    let manifest = &out.posts_of(command::TESTFILEREQUEST)[0];
    assert_eq!(manifest.list(arg::FILECOUNT, arg::FILE), vec!["test_sub"]);
    assert_eq!(out.uploads_to(&test_node()).len(), 1);
}

#[test]
fn compiler_exception_returns_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    write_request(dir.path(), &["main.rs"], &[]);
    let out = RecordingOutbox::new(Node::new("localhost", 8090));
    let compiler = CountingCompiler {
        fail: true,
        ..Default::default()
    };
    let mut worker = Worker::new(settings(dir.path()), compiler);
    let session = accept(&mut worker, &out);

    deliver(dir.path(), &session, &["main.rs"]);
    worker
        .handle(&out, reply_from(command::FILEREQUESTCOMPLETE, repository(), &session))
        .unwrap();

    assert_eq!(calls(worker.compiler()), 1);
    assert_eq!(worker.phase(), Phase::Idle);
    let notes = out.notifications();
    assert!(notes.last().unwrap().contains("exception"), "{:?}", notes);
    assert!(out.uploads_to(&repository()).is_empty());
    assert!(out.uploads_to(&test_node()).is_empty());
    assert_eq!(out.posts_of(command::READY).len(), 1);
}

#[test]
fn failed_build_ships_log_but_skips_tests() {
    let dir = tempfile::tempdir().unwrap();
    write_request(dir.path(), &["main.rs"], &[]);
    let out = RecordingOutbox::new(Node::new("localhost", 8090));
    let compiler = CountingCompiler {
        stdout: "error[E0425]: cannot find value".to_owned(),
        ..Default::default()
    };
    let mut worker = Worker::new(settings(dir.path()), compiler);
    let session = accept(&mut worker, &out);

    deliver(dir.path(), &session, &["main.rs"]);
    worker
        .handle(&out, reply_from(command::FILEREQUESTCOMPLETE, repository(), &session))
        .unwrap();

    let logs = out.uploads_to(&repository());
    assert_eq!(logs.len(), 1);
    let text = std::fs::read_to_string(&logs[0]).unwrap();
    assert!(text.contains("result: failed"), "{}", text);
    assert!(text.contains("E0425"));
    assert!(out.uploads_to(&test_node()).is_empty());
    assert!(out.posts_of(command::EXECTESTCASES).is_empty());
    assert_eq!(worker.phase(), Phase::Idle);
    assert_eq!(out.posts_of(command::READY).len(), 1);
}

#[test]
fn unreachable_test_node_skips_tests() {
    let dir = tempfile::tempdir().unwrap();
    write_request(dir.path(), &[], &["test_add.rs"]);
    let out = RecordingOutbox::new(Node::new("localhost", 8090));
    out.refuse(&test_node());
    let mut worker = Worker::new(settings(dir.path()), CountingCompiler::default());
    let session = accept(&mut worker, &out);

    deliver(dir.path(), &session, &["test_add.rs"]);
    worker
        .handle(&out, reply_from(command::FILEREQUESTCOMPLETE, repository(), &session))
        .unwrap();

    assert!(out.posts_of(command::EXECTESTCASES).is_empty());
    assert_eq!(worker.phase(), Phase::Idle);
    assert_eq!(out.posts_of(command::READY).len(), 1);
}

#[test]
fn one_session_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    write_request(dir.path(), &["a.rs"], &[]);
    let out = RecordingOutbox::new(Node::new("localhost", 8090));
    let mut worker = Worker::new(settings(dir.path()), CountingCompiler::default());
    let session = accept(&mut worker, &out);

    worker.handle(&out, build_request()).unwrap();

    assert_eq!(worker.session_id(), Some(session.as_str()));
    assert!(out.posts_of(command::FILEREQUEST).is_empty());
    assert!(out.posts_of(command::READY).is_empty());
    assert!(out.notifications()[0].contains("busy"));
}

#[test]
fn stale_replies_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    write_request(dir.path(), &["a.rs"], &[]);
    let out = RecordingOutbox::new(Node::new("localhost", 8090));
    let mut worker = Worker::new(settings(dir.path()), CountingCompiler::default());

    worker
        .handle(&out, reply_from(command::FILEREQUESTCOMPLETE, repository(), "nope"))
        .unwrap();
    assert_eq!(worker.phase(), Phase::Idle);

    let session = accept(&mut worker, &out);
    worker
        .handle(&out, reply_from(command::FILEREQUESTCOMPLETE, repository(), "other"))
        .unwrap();
    worker
        .handle(&out, reply_from(command::TESTFILEREQUEST, test_node(), &session))
        .unwrap();
    assert_eq!(worker.phase(), Phase::AwaitingFiles);
    assert!(out.events().is_empty());
}

#[test]
fn malformed_request_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("calc.toml"), "not = [valid").unwrap();
    let out = RecordingOutbox::new(Node::new("localhost", 8090));
    let mut worker = Worker::new(settings(dir.path()), CountingCompiler::default());

    worker.handle(&out, build_request()).unwrap();

    assert_eq!(worker.phase(), Phase::Idle);
    assert_eq!(out.notifications().len(), 1);
    assert_eq!(out.posts_of(command::READY).len(), 1);
    assert!(out.posts_of(command::FILEREQUEST).is_empty());
}
