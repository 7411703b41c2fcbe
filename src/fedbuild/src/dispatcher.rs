use crate::command::{self, arg};
use crate::request;
use crate::runtime::{client_of, notify, Handler};
use litemsg::{HandoffQueue, Message, MessageKind, Node, Outbox};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How often a blocked matchmaker looks at the stop flag.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Starts worker processes.
pub trait Spawner {
    /// Starts one worker that will listen at `node`.
    fn spawn(&mut self, node: &Node) -> anyhow::Result<()>;

    /// Collects workers that have exited. Never blocks.
    fn reap(&mut self) {}
}

/// Launches `<program> <host> <port> --config <config>` per worker.
pub struct ProcessSpawner {
    program: PathBuf,
    config: PathBuf,
    children: Vec<(Node, Child)>,
}

impl ProcessSpawner {
    pub fn new(program: PathBuf, config: PathBuf) -> Self {
        ProcessSpawner {
            program,
            config,
            children: Vec::new(),
        }
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&mut self, node: &Node) -> anyhow::Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&node.addr)
            .arg(node.port.to_string())
            .arg("--config")
            .arg(&self.config);
        log::info!("spawning worker: {}", utils::cmd_helper::get_command_str(&cmd));
        let child = cmd.spawn()?;
        self.children.push((node.clone(), child));
        Ok(())
    }

    fn reap(&mut self) {
        let mut i = 0;
        while i < self.children.len() {
            let (node, child) = &mut self.children[i];
            match child.try_wait() {
                Ok(None) => i += 1,
                Ok(Some(status)) => {
                    log::info!("worker {} exited: {}", node, status);
                    self.children.swap_remove(i);
                }
                Err(e) => {
                    log::warn!("lost track of worker {}: {}", node, e);
                    self.children.swap_remove(i);
                }
            }
        }
    }
}

impl Drop for ProcessSpawner {
    fn drop(&mut self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        for (node, child) in &mut self.children {
            loop {
                match child.try_wait() {
                    Ok(Some(_)) | Err(_) => break,
                    Ok(None) if Instant::now() >= deadline => {
                        log::warn!("killing worker {}", node);
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                    Ok(None) => std::thread::sleep(Duration::from_millis(10)),
                }
            }
        }
    }
}

/// Worker processes the dispatcher knows about.
pub struct WorkerPool<S> {
    host: String,
    next_port: Option<u16>,
    spawner: S,
    workers: Vec<Node>,
    /// told to shut down; a late READY from one of these is not an idle worker
    stopped: Vec<Node>,
}

impl<S: Spawner> WorkerPool<S> {
    pub fn new(host: &str, base_port: u16, spawner: S) -> Self {
        WorkerPool {
            host: host.to_owned(),
            next_port: Some(base_port),
            spawner,
            workers: Vec::new(),
            stopped: Vec::new(),
        }
    }

    #[inline]
    pub fn workers(&self) -> &[Node] {
        &self.workers
    }

    #[inline]
    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    /// Starts `n` workers on consecutive ports and returns the addresses of those that started.
    pub fn create_workers(&mut self, n: usize) -> Vec<Node> {
        self.spawner.reap();
        let mut created = Vec::with_capacity(n);
        for _ in 0..n {
            let port = match self.next_port {
                Some(p) => p,
                None => {
                    log::error!("worker ports exhausted");
                    break;
                }
            };
            self.next_port = port.checked_add(1);

            let node = Node::new(&self.host, port);
            self.stopped.retain(|n| n != &node);
            match self.spawner.spawn(&node) {
                Ok(()) => {
                    self.register(node.clone());
                    created.push(node);
                }
                Err(e) => log::error!("failed to start worker at {}: {}", node, e),
            }
        }
        created
    }

    /// Remembers a worker that reported in, whoever started it. Returns false
    /// for a worker that was stopped and not started again since.
    pub fn register(&mut self, node: Node) -> bool {
        if self.stopped.contains(&node) {
            return false;
        }
        if !self.workers.contains(&node) {
            self.workers.push(node);
        }
        true
    }

    /// Tells every known worker to shut down and forgets about all of them.
    pub fn stop_workers(&mut self, out: &dyn Outbox, ready: &HandoffQueue<Node>) -> usize {
        let count = self.workers.len();
        for worker in self.workers.drain(..) {
            let mut close = Message::new(MessageKind::CloseReceiver);
            close.to = worker.clone();
            out.post(close.with_auto_disconnect());
            if !self.stopped.contains(&worker) {
                self.stopped.push(worker);
            }
        }
        ready.clear();
        self.spawner.reap();
        log::info!("asked {} workers to stop", count);
        count
    }
}

/// Pairs pending build requests with idle workers, strictly one to one.
pub struct Matchmaker<O> {
    ready: Arc<HandoffQueue<Node>>,
    requests: Arc<HandoffQueue<Message>>,
    /// where request files uploaded to the dispatcher land
    inbox: PathBuf,
    out: O,
    stop: Arc<AtomicBool>,
}

impl<O: Outbox> Matchmaker<O> {
    /// Blocks until both a request and a worker are available, or the dispatcher stops.
    pub fn next_pair(&self) -> Option<(Message, Node)> {
        let request = self.wait_for(&self.requests)?;
        match self.wait_for(&self.ready) {
            Some(worker) => Some((request, worker)),
            None => {
                log::warn!("dispatcher stopping, pending {} dropped", request);
                None
            }
        }
    }

    fn wait_for<T>(&self, queue: &HandoffQueue<T>) -> Option<T> {
        while !self.stop.load(SeqCst) {
            if let Some(item) = queue.dequeue_timeout(STOP_POLL) {
                return Some(item);
            }
        }
        None
    }

    /// Hands the request file to `worker`, then the request itself.
    pub fn dispatch(&self, mut request: Message, worker: Node) {
        let client = client_of(&request);
        let project = request
            .arg(arg::PROJECT)
            .map(request::file_name)
            .unwrap_or_default();
        let path = self.inbox.join(&project);

        if project.is_empty() || !path.is_file() {
            log::warn!("request file {:?} not found in {}", project, self.inbox.display());
            notify(
                &self.out,
                &client,
                format!("request file {} not found at the dispatcher, request dropped", project),
            );
            // the worker never saw the request, so it is still idle
            self.ready.enqueue(worker);
            return;
        }

        if let Err(e) = self.out.post_file(&path, &worker, None) {
            log::warn!("cannot hand {} to worker {}: {}", project, worker, e);
            notify(
                &self.out,
                &client,
                format!("worker {} unreachable, request {} dropped", worker, project),
            );
            return;
        }

        request.kind = MessageKind::Request;
        request.to = worker.clone();
        request.auto_disconnect = false;
        request
            .args
            .insert(arg::CLIENTDETAILS.to_owned(), client.to_string());
        self.out.post(request);
        notify(
            &self.out,
            &client,
            format!("request {} dispatched to worker {}", project, worker),
        );
    }

    pub fn run(self) {
        log::debug!("matchmaker started");
        while let Some((request, worker)) = self.next_pair() {
            self.dispatch(request, worker);
        }
        log::debug!("matchmaker stopped");
    }
}

/// The mother process: queues requests and idle workers and manages the pool.
pub struct Dispatcher<S> {
    ready: Arc<HandoffQueue<Node>>,
    requests: Arc<HandoffQueue<Message>>,
    pool: WorkerPool<S>,
    stop: Arc<AtomicBool>,
    matchmaker: Option<JoinHandle<()>>,
}

impl<S: Spawner> Dispatcher<S> {
    pub fn new(pool: WorkerPool<S>) -> Self {
        Dispatcher {
            ready: Arc::new(HandoffQueue::new()),
            requests: Arc::new(HandoffQueue::new()),
            pool,
            stop: Arc::new(AtomicBool::new(false)),
            matchmaker: None,
        }
    }

    #[inline]
    pub fn ready_queue(&self) -> &HandoffQueue<Node> {
        &self.ready
    }

    #[inline]
    pub fn request_queue(&self) -> &HandoffQueue<Message> {
        &self.requests
    }

    #[inline]
    pub fn pool(&self) -> &WorkerPool<S> {
        &self.pool
    }

    /// A matchmaker over this dispatcher's queues, posting through `out`.
    pub fn matchmaker<O: Outbox>(&self, out: O, inbox: &Path) -> Matchmaker<O> {
        Matchmaker {
            ready: Arc::clone(&self.ready),
            requests: Arc::clone(&self.requests),
            inbox: inbox.to_path_buf(),
            out,
            stop: Arc::clone(&self.stop),
        }
    }

    /// Runs the matchmaker on its own thread until shutdown.
    pub fn start_matchmaker<O>(&mut self, out: O, inbox: &Path) -> anyhow::Result<()>
    where
        O: Outbox + Send + 'static,
    {
        let matchmaker = self.matchmaker(out, inbox);
        let handle = std::thread::Builder::new()
            .name("matchmaker".to_owned())
            .spawn(move || matchmaker.run())?;
        self.matchmaker = Some(handle);
        Ok(())
    }
}

impl<S: Spawner> Handler for Dispatcher<S> {
    fn handle(&mut self, out: &dyn Outbox, msg: Message) -> anyhow::Result<()> {
        match msg.command.as_str() {
            command::READY => {
                if self.pool.register(msg.from.clone()) {
                    log::info!("worker {} is ready", msg.from);
                    self.ready.enqueue(msg.from);
                } else {
                    log::info!("ignoring READY from stopped worker {}", msg.from);
                }
            }
            command::BUILDREQUEST => {
                let client = client_of(&msg);
                let project = msg.arg(arg::PROJECT).unwrap_or_default().to_owned();
                self.requests.enqueue(msg);
                notify(
                    out,
                    &client,
                    format!(
                        "request {} queued at the dispatcher, {} pending",
                        project,
                        self.requests.len()
                    ),
                );
            }
            command::STARTCHILDPROCESS => {
                let n = msg
                    .arg_usize(arg::NOOFPROC)
                    .ok_or_else(|| anyhow::anyhow!("{} without a valid {}", msg.command, arg::NOOFPROC))?;
                let created = self.pool.create_workers(n);
                let addrs: Vec<String> = created.iter().map(Node::to_string).collect();
                notify(
                    out,
                    &msg.from,
                    format!("started {} of {} workers: {}", created.len(), n, addrs.join(", ")),
                );
            }
            command::STOPCHILDPROCESS => {
                let count = self.pool.stop_workers(out, &self.ready);
                notify(out, &msg.from, format!("stopped {} workers", count));
            }
            other => {
                log::warn!("dispatcher ignores command {:?} from {}", other, msg.from);
            }
        }
        Ok(())
    }

    fn on_shutdown(&mut self, out: &dyn Outbox) {
        self.stop.store(true, SeqCst);
        self.pool.stop_workers(out, &self.ready);
        if let Some(handle) = self.matchmaker.take() {
            if handle.join().is_err() {
                log::error!("matchmaker thread panicked");
            }
        }
        let pending = self.requests.len();
        if pending > 0 {
            log::warn!("{} build requests were never dispatched", pending);
        }
    }
}
