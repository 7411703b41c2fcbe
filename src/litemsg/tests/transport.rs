use litemsg::receiver::UploadRouter;
use litemsg::{Comm, FileTransferArgs, Identity, Message, MessageKind, Node, Outbox};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn loopback() -> Node {
    Node::new("127.0.0.1", 0)
}

fn start(identity: Identity, root: PathBuf) -> Comm {
    let router: Arc<dyn UploadRouter> = Arc::new(move |_name: &str, args: &FileTransferArgs| {
        match &args.session_id {
            Some(session) => root.join(session),
            None => root.clone(),
        }
    });
    Comm::start(identity, &loopback(), router).unwrap()
}

fn next_request(comm: &Comm) -> Message {
    loop {
        let msg = comm
            .inbound()
            .dequeue_timeout(Duration::from_secs(10))
            .expect("no message within 10s");
        if msg.kind != MessageKind::Connect {
            return msg;
        }
    }
}

#[test]
fn messages_arrive_in_order_with_sender_stamped() {
    logging::init_log();
    let dir = tempfile::tempdir().unwrap();
    let a = start(Identity::Worker, dir.path().join("a"));
    let b = start(Identity::Dispatcher, dir.path().join("b"));

    for i in 0..20 {
        a.post(Message::request("READY", b.local().clone()).with_arg("SEQ", i));
    }

    for i in 0..20 {
        let msg = next_request(&b);
        assert_eq!(msg.command, "READY");
        assert_eq!(msg.arg("SEQ"), Some(i.to_string().as_str()));
        assert_eq!(&msg.from, a.local());
        assert_eq!(msg.identity, Identity::Worker);
        assert!(!msg.thread_id.is_empty());
    }
}

#[test]
fn chunked_upload_reproduces_bytes() {
    logging::init_log();
    let dir = tempfile::tempdir().unwrap();
    let src_dir = dir.path().join("src");
    std::fs::create_dir_all(&src_dir).unwrap();
    let a = start(Identity::Repository, dir.path().join("a"));
    let b = start(Identity::Worker, dir.path().join("b"));

    for &size in &[0usize, 1, 1023, 1024, 1025, 4096, 10_000] {
        let content: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
        let name = format!("file_{}.bin", size);
        let path = src_dir.join(&name);
        std::fs::write(&path, &content).unwrap();

        a.post_file(&path, b.local(), Some(FileTransferArgs::for_session("s1")))
            .unwrap();

        let received = std::fs::read(dir.path().join("b").join("s1").join(&name)).unwrap();
        assert_eq!(received, content, "size {} differs", size);
    }
}

#[test]
fn upload_is_ordered_before_later_message() {
    logging::init_log();
    let dir = tempfile::tempdir().unwrap();
    let a = start(Identity::Dispatcher, dir.path().join("a"));
    let b = start(Identity::Worker, dir.path().join("b"));

    let path = dir.path().join("request.toml");
    std::fs::write(&path, b"build_files = []").unwrap();
    a.post_file(&path, b.local(), None).unwrap();
    a.post(Message::request("BUILDREQUEST", b.local().clone()).with_arg("PROJECT", "request.toml"));

    let msg = next_request(&b);
    assert_eq!(msg.command, "BUILDREQUEST");
    assert!(dir.path().join("b").join("request.toml").exists());
}

#[test]
fn unreachable_peer_is_dropped_and_sender_keeps_going() {
    logging::init_log();
    let dir = tempfile::tempdir().unwrap();
    let a = start(Identity::Worker, dir.path().join("a"));
    let b = start(Identity::Dispatcher, dir.path().join("b"));

    // nothing listens on a bound-then-released port
    let dead = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        Node::new("127.0.0.1", l.local_addr().unwrap().port())
    };
    a.post(Message::request("READY", dead.clone()));
    a.post(Message::request("READY", b.local().clone()).with_auto_disconnect());
    a.post(Message::request("READY", b.local().clone()));

    assert_eq!(next_request(&b).command, "READY");
    assert_eq!(next_request(&b).command, "READY");

    let missing = dir.path().join("missing.txt");
    assert!(a.post_file(&missing, b.local(), None).is_err());
}

#[test]
fn upload_to_dead_peer_fails() {
    logging::init_log();
    let dir = tempfile::tempdir().unwrap();
    let a = start(Identity::Worker, dir.path().join("a"));
    let path = dir.path().join("x.txt");
    std::fs::write(&path, b"x").unwrap();

    let dead = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        Node::new("127.0.0.1", l.local_addr().unwrap().port())
    };
    assert!(a.post_file(&path, &dead, None).is_err());
}

#[test]
fn stray_bytes_only_cost_their_connection() {
    use std::io::{Read, Write};
    logging::init_log();
    let dir = tempfile::tempdir().unwrap();
    let a = start(Identity::Client, dir.path().join("a"));
    let b = start(Identity::Repository, dir.path().join("b"));

    let mut stray = std::net::TcpStream::connect(("127.0.0.1", b.local().port)).unwrap();
    stray
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    stray.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    // the receiver hangs up instead of answering
    let mut buf = [0u8; 16];
    assert!(matches!(stray.read(&mut buf), Ok(0) | Err(_)));

    a.post(Message::request("GETDIRCONTENTS", b.local().clone()).with_arg("DIRNAME", "$"));
    let msg = next_request(&b);
    assert_eq!(msg.command, "GETDIRCONTENTS");
    assert_eq!(&msg.from, a.local());
}
