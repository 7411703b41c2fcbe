use crate::command::{Ack, Command};
use crate::endpoint::Endpoint;
use crate::{Error, FileTransferArgs, HandoffQueue, Message, Node, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const LISTENER: mio::Token = mio::Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Chooses where an uploaded file lands. Called before the file is created,
/// once per upload, on the receiving node's network thread.
pub trait UploadRouter: Send + Sync {
    fn destination(&self, filename: &str, args: &FileTransferArgs) -> PathBuf;
}

impl<F> UploadRouter for F
where
    F: Fn(&str, &FileTransferArgs) -> PathBuf + Send + Sync,
{
    fn destination(&self, filename: &str, args: &FileTransferArgs) -> PathBuf {
        self(filename, args)
    }
}

/// Accepts connections from any peer and funnels every posted message into one queue.
pub struct Receiver {
    local: Node,
    queue: Arc<HandoffQueue<Message>>,
    terminate: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Receiver {
    /// Binds `listen` and starts the network thread.
    ///
    /// A port of 0 binds an ephemeral port; [`Receiver::local`] reports the real one.
    pub fn start(listen: &Node, router: Arc<dyn UploadRouter>) -> Result<Receiver> {
        let listener = crate::utils::bind_retry(listen)?;
        let port = listener.local_addr()?.port();
        let local = Node::new(&listen.addr, port);
        log::info!("listening at address: {}", local);

        let queue = Arc::new(HandoffQueue::new());
        let terminate = Arc::new(AtomicBool::new(false));

        let mut io_loop = IoLoop {
            listener: mio::net::TcpListener::from_std(listener)?,
            poll: mio::Poll::new()?,
            conns: HashMap::new(),
            next_token: LISTENER.0 + 1,
            queue: Arc::clone(&queue),
            router,
            terminate: Arc::clone(&terminate),
        };

        let handle = std::thread::Builder::new()
            .name(format!("receiver-{}", port))
            .spawn(move || {
                if let Err(e) = io_loop.run() {
                    log::error!("receiver network loop exited: {}", e);
                }
            })?;

        Ok(Receiver {
            local,
            queue,
            terminate,
            handle: Some(handle),
        })
    }

    #[inline]
    pub fn local(&self) -> &Node {
        &self.local
    }

    #[inline]
    pub fn queue(&self) -> &Arc<HandoffQueue<Message>> {
        &self.queue
    }

    /// Blocks until a message arrives from any peer.
    pub fn get_message(&self) -> Message {
        self.queue.dequeue()
    }

    /// Stops accepting frames. Uploads in flight are abandoned.
    pub fn close(&mut self) {
        self.terminate.store(true, SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("receiver network thread panicked");
            }
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.close();
    }
}

struct Upload {
    path: PathBuf,
    file: std::fs::File,
}

struct Connection {
    ep: Endpoint,
    upload: Option<Upload>,
}

struct IoLoop {
    listener: mio::net::TcpListener,
    poll: mio::Poll,
    conns: HashMap<usize, Connection>,
    next_token: usize,
    queue: Arc<HandoffQueue<Message>>,
    router: Arc<dyn UploadRouter>,
    terminate: Arc<AtomicBool>,
}

impl IoLoop {
    fn run(&mut self) -> Result<()> {
        self.poll.register(
            &self.listener,
            LISTENER,
            mio::Ready::readable(),
            mio::PollOpt::level(),
        )?;

        let mut events = mio::Events::with_capacity(256);
        while !self.terminate.load(SeqCst) {
            self.poll.poll(&mut events, Some(POLL_TIMEOUT))?;
            for event in events.iter() {
                if event.token() == LISTENER {
                    self.accept_all()?;
                    continue;
                }

                let token = event.token().0;
                let readiness = event.readiness();
                if let Err(e) = self.on_event(token, readiness) {
                    match e {
                        Error::ConnectionLost => {}
                        e => log::warn!("dropping connection {}: {}", token, e),
                    }
                    self.drop_connection(token);
                }
            }
        }

        log::debug!("receiver network loop stopped");
        Ok(())
    }

    fn accept_all(&mut self) -> Result<()> {
        loop {
            match self.listener.accept_std() {
                Ok((stream, addr)) => {
                    log::trace!("accepted a connection from {}", addr);
                    let peer = Node::new(&addr.ip().to_string(), addr.port());
                    let ep = Endpoint::new(stream, peer)?;
                    let token = self.next_token;
                    self.next_token += 1;
                    self.poll.register(
                        ep.stream(),
                        mio::Token(token),
                        mio::Ready::readable(),
                        mio::PollOpt::level(),
                    )?;
                    self.conns.insert(token, Connection { ep, upload: None });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn on_event(&mut self, token: usize, readiness: mio::Ready) -> Result<()> {
        let conn = match self.conns.get_mut(&token) {
            Some(conn) => conn,
            None => return Ok(()),
        };

        if readiness.is_readable() {
            loop {
                match conn.ep.on_recv_ready::<Command>() {
                    Ok(cmd) => {
                        let ack = handle_command(conn, cmd, &self.queue, &*self.router);
                        conn.ep.post(ack)?;
                    }
                    Err(Error::WouldBlock) => break,
                    Err(e) => return Err(e),
                }
            }
        }

        match conn.ep.on_send_ready() {
            Ok(()) | Err(Error::NothingToSend) => {
                self.poll.reregister(
                    conn.ep.stream(),
                    mio::Token(token),
                    mio::Ready::readable(),
                    mio::PollOpt::level(),
                )?;
            }
            Err(Error::WouldBlock) => {
                // the reply did not fit into the socket buffer, wait for writability
                self.poll.reregister(
                    conn.ep.stream(),
                    mio::Token(token),
                    mio::Ready::readable() | mio::Ready::writable(),
                    mio::PollOpt::level(),
                )?;
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }

    fn drop_connection(&mut self, token: usize) {
        if let Some(conn) = self.conns.remove(&token) {
            if let Some(upload) = conn.upload {
                log::warn!(
                    "connection from {} closed during upload of {}",
                    conn.ep.peer(),
                    upload.path.display()
                );
            }
            let _ = self.poll.deregister(conn.ep.stream());
        }
    }
}

fn handle_command(
    conn: &mut Connection,
    cmd: Command,
    queue: &HandoffQueue<Message>,
    router: &dyn UploadRouter,
) -> Ack {
    match cmd {
        Command::Post(mut msg) => {
            msg.thread_id = format!("{:?}", std::thread::current().id());
            log::trace!("enqueue {}", msg);
            queue.enqueue(msg);
            Ack::Ok
        }
        Command::OpenFile(name, args) => match open_upload(&name, &args, router) {
            Ok(upload) => {
                if let Some(prev) = conn.upload.replace(upload) {
                    log::warn!("upload of {} superseded before close", prev.path.display());
                }
                Ack::Ok
            }
            Err(e) => {
                log::error!("cannot open {} for writing: {}", name, e);
                Ack::Failed(e.to_string())
            }
        },
        Command::WriteBlock(block) => match conn.upload.as_mut() {
            Some(upload) => match upload.file.write_all(&block) {
                Ok(()) => Ack::Ok,
                Err(e) => Ack::Failed(e.to_string()),
            },
            None => Ack::Failed("no file is open".to_owned()),
        },
        Command::CloseFile => match conn.upload.take() {
            Some(mut upload) => match upload.file.flush() {
                Ok(()) => {
                    log::debug!("received file: {}", upload.path.display());
                    Ack::Ok
                }
                Err(e) => Ack::Failed(e.to_string()),
            },
            None => Ack::Failed("no file is open".to_owned()),
        },
    }
}

fn open_upload(name: &str, args: &FileTransferArgs, router: &dyn UploadRouter) -> Result<Upload> {
    // only the last component is honored so an upload cannot escape its directory
    let file_name = Path::new(name)
        .file_name()
        .ok_or_else(|| Error::Rejected(format!("invalid file name: {}", name)))?;
    let dir = router.destination(name, args);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(file_name);
    let file = std::fs::File::create(&path)?;
    Ok(Upload { path, file })
}
