use crate::command::{Ack, Command, BLOCK_SIZE};
use crate::utils::{recv_cmd_sync, send_cmd_sync, with_retry};
use crate::{Error, FileTransferArgs, HandoffQueue, Identity, Message, MessageKind, Node, Result};
use crossbeam::channel;
use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How long a peer may take to acknowledge one frame.
const ACK_TIMEOUT: Duration = Duration::from_secs(60);

enum Outgoing {
    Message(Message),
    File {
        path: PathBuf,
        to: Node,
        args: FileTransferArgs,
        done: channel::Sender<Result<()>>,
    },
}

/// Outbound half of a node. Owns the single delivery thread.
pub struct Sender {
    handle: SenderHandle,
    thread: Option<JoinHandle<()>>,
}

/// A cloneable way to post through a [`Sender`] from other threads.
///
/// Everything posted through any handle shares the sender's one queue, so
/// ordering is still FIFO per sender.
#[derive(Clone)]
pub struct SenderHandle {
    local: Node,
    identity: Identity,
    queue: Arc<HandoffQueue<Outgoing>>,
}

impl Sender {
    pub fn start(local: Node, identity: Identity) -> Result<Sender> {
        let queue = Arc::new(HandoffQueue::new());
        let worker = DeliveryThread {
            local: local.clone(),
            identity,
            queue: Arc::clone(&queue),
            conn: Connection::Disconnected,
        };
        let thread = std::thread::Builder::new()
            .name(format!("sender-{}", local.port))
            .spawn(move || worker.run())?;

        Ok(Sender {
            handle: SenderHandle {
                local,
                identity,
                queue,
            },
            thread: Some(thread),
        })
    }

    #[inline]
    pub fn local(&self) -> &Node {
        &self.handle.local
    }

    #[inline]
    pub fn handle(&self) -> SenderHandle {
        self.handle.clone()
    }

    pub fn post_message(&self, msg: Message) {
        self.handle.post_message(msg)
    }

    pub fn post_file(&self, path: &Path, to: &Node, args: Option<FileTransferArgs>) -> Result<()> {
        self.handle.post_file(path, to, args)
    }

    /// Stops the delivery thread after it drains the queue.
    pub fn close(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle
                .queue
                .enqueue(Outgoing::Message(Message::new(MessageKind::CloseSender)));
            if thread.join().is_err() {
                log::error!("sender delivery thread panicked");
            }
        }
    }
}

impl SenderHandle {
    #[inline]
    pub fn local(&self) -> &Node {
        &self.local
    }

    /// Queues `msg` for delivery and returns immediately.
    ///
    /// Posting a `CloseSender` message stops the delivery thread once everything
    /// queued before it has been handled.
    pub fn post_message(&self, mut msg: Message) {
        msg.from = self.local.clone();
        msg.identity = self.identity;
        log::debug!("sending from {} to {} -> {:?}", msg.from, msg.to, msg.command);
        self.queue.enqueue(Outgoing::Message(msg));
    }

    /// Uploads `path` to `to` in blocks and waits until the transfer has finished.
    ///
    /// The transfer runs on the delivery thread, so it is ordered with respect
    /// to every message posted before and after it.
    pub fn post_file(&self, path: &Path, to: &Node, args: Option<FileTransferArgs>) -> Result<()> {
        let mut args = args.unwrap_or_default();
        args.identity = self.identity;
        let (tx, rx) = channel::bounded(1);
        self.queue.enqueue(Outgoing::File {
            path: path.to_path_buf(),
            to: to.clone(),
            args,
            done: tx,
        });
        rx.recv().map_err(|_| Error::ConnectionLost)?
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connection state of the delivery thread, only ever touched by that thread.
enum Connection {
    Disconnected,
    Connected { peer: Node, stream: TcpStream },
}

struct DeliveryThread {
    local: Node,
    identity: Identity,
    queue: Arc<HandoffQueue<Outgoing>>,
    conn: Connection,
}

impl DeliveryThread {
    fn run(mut self) {
        log::debug!("delivery thread of {} started", self.local);
        loop {
            match self.queue.dequeue() {
                Outgoing::Message(msg) if msg.kind == MessageKind::CloseSender => break,
                Outgoing::Message(msg) => self.deliver(msg),
                Outgoing::File {
                    path,
                    to,
                    args,
                    done,
                } => {
                    let res = transfer_file(&path, &to, &args);
                    if let Err(ref e) = res {
                        log::warn!("upload of {} to {} failed: {}", path.display(), to, e);
                    }
                    let _ = done.send(res);
                }
            }
        }
        self.conn = Connection::Disconnected;
        // pending uploads see their reply channel dropped and fail
        self.queue.clear();
        log::debug!("delivery thread of {} stopped", self.local);
    }

    fn deliver(&mut self, msg: Message) {
        let to = msg.to.clone();
        let auto_disconnect = msg.auto_disconnect;
        let summary = msg.to_string();
        let frame = Command::Post(msg);

        let mut delivered = false;
        if let Connection::Connected {
            ref peer,
            ref mut stream,
        } = self.conn
        {
            if *peer == to {
                match round_trip(stream, &frame) {
                    Ok(()) => delivered = true,
                    Err(e) => log::debug!("warm connection to {} broke: {}, reconnecting", to, e),
                }
            }
        }

        if !delivered {
            // close the old connection before dialing the new destination
            self.conn = Connection::Disconnected;
            let mut stream = match self.connect(&to) {
                Ok(stream) => stream,
                Err(e) => {
                    log::warn!("{} ... is lost: {}", summary, e);
                    return;
                }
            };
            if let Err(e) = round_trip(&mut stream, &frame) {
                log::warn!("{} ... is lost: {}", summary, e);
                return;
            }
            self.conn = Connection::Connected { peer: to, stream };
        }

        if auto_disconnect {
            self.conn = Connection::Disconnected;
        }
    }

    /// Opens a connection and completes one handshake round trip.
    fn connect(&self, to: &Node) -> Result<TcpStream> {
        let mut hello = Message::new(MessageKind::Connect);
        hello.from = self.local.clone();
        hello.to = to.clone();
        hello.identity = self.identity;
        let hello = Command::Post(hello);

        with_retry(to, || {
            let mut stream = open_stream(to)?;
            round_trip(&mut stream, &hello)?;
            Ok(stream)
        })
    }
}

fn open_stream(to: &Node) -> Result<TcpStream> {
    let stream = TcpStream::connect(to)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(ACK_TIMEOUT))?;
    Ok(stream)
}

fn round_trip(stream: &mut TcpStream, frame: &Command) -> Result<()> {
    send_cmd_sync(stream, frame)?;
    let ack: Ack = recv_cmd_sync(stream)?;
    ack.into_result()
}

/// open -> write block * ceil(n / BLOCK_SIZE) -> close, on a dedicated connection.
fn transfer_file(path: &Path, to: &Node, args: &FileTransferArgs) -> Result<()> {
    let mut file = std::fs::File::open(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Rejected(format!("not a file: {}", path.display())))?;

    let mut stream = with_retry(to, || open_stream(to))?;
    round_trip(&mut stream, &Command::OpenFile(name, args.clone()))?;

    let mut block = vec![0u8; BLOCK_SIZE];
    loop {
        let n = read_block(&mut file, &mut block)?;
        if n == 0 {
            break;
        }
        round_trip(&mut stream, &Command::WriteBlock(block[..n].to_vec()))?;
        if n < BLOCK_SIZE {
            break;
        }
    }

    round_trip(&mut stream, &Command::CloseFile)?;
    log::debug!("uploaded {} to {}", path.display(), to);
    Ok(())
}

/// Fills `buf` unless the end of the file comes first.
fn read_block(file: &mut std::fs::File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
