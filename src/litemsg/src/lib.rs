//! Message passing between named nodes.
//!
//! A node owns one [`Receiver`](receiver::Receiver) that accepts frames from any
//! peer and drops every posted [`Message`] into a single [`HandoffQueue`], and one
//! [`Sender`](sender::Sender) whose delivery thread drains an outbound queue and
//! keeps at most one warm connection. [`Comm`](comm::Comm) bundles the two.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod buffer;
pub mod comm;
pub mod command;
pub mod endpoint;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod utils;

pub use comm::{Comm, Outbox};
pub use queue::HandoffQueue;
pub use sender::SenderHandle;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WouldBlock")]
    WouldBlock,
    #[error("Nothing to send")]
    NothingToSend,
    #[error("Connection has been dropped")]
    ConnectionLost,
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization failed: {0}")]
    Serialize(#[from] bincode::Error),
    #[error("{0} is unreachable after {1} attempts")]
    Unreachable(Node, usize),
    #[error("peer rejected the request: {0}")]
    Rejected(String),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The address of a node, `host:port`.
#[derive(Debug, Clone, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub addr: String,
    pub port: u16,
}

impl Node {
    pub fn new(addr: &str, port: u16) -> Self {
        Node {
            addr: addr.to_owned(),
            port,
        }
    }

    #[inline]
    pub fn is_unset(&self) -> bool {
        self.addr.is_empty() && self.port == 0
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl std::str::FromStr for Node {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (addr, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("missing port in address: {}", s))?;
        if addr.is_empty() {
            anyhow::bail!("missing host in address: {}", s);
        }
        Ok(Node {
            addr: addr.to_owned(),
            port: port.parse()?,
        })
    }
}

impl std::net::ToSocketAddrs for Node {
    type Iter = std::vec::IntoIter<std::net::SocketAddr>;
    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        (&*self.addr, self.port).to_socket_addrs()
    }
}

/// The role a node plays in the federation. Used as the key into a node's address book.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identity {
    Dispatcher,
    Worker,
    Repository,
    Client,
    TestNode,
    Unidentified,
}

impl Default for Identity {
    fn default() -> Self {
        Identity::Unidentified
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Dispatcher => "dispatcher",
            Self::Worker => "worker",
            Self::Repository => "repository",
            Self::Client => "client",
            Self::TestNode => "testnode",
            Self::Unidentified => "unidentified",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// handshake, discarded by the receiving node
    Connect,
    Request,
    Reply,
    /// stops the delivery thread of the sender it is posted to
    CloseSender,
    /// asks the receiving node to shut down
    CloseReceiver,
}

/// Accompanies a file upload so the receiving node can pick a destination directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransferArgs {
    pub identity: Identity,
    pub session_id: Option<String>,
}

impl FileTransferArgs {
    pub fn for_session(session_id: &str) -> Self {
        FileTransferArgs {
            identity: Identity::Unidentified,
            session_id: Some(session_id.to_owned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub command: String,
    pub from: Node,
    pub to: Node,
    pub identity: Identity,
    /// The only generic payload. The command selects which keys are expected.
    pub args: HashMap<String, String>,
    pub thread_id: String,
    pub error: String,
    /// Tear the connection down right after this message is delivered.
    pub auto_disconnect: bool,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Message {
            kind,
            command: String::new(),
            from: Node::default(),
            to: Node::default(),
            identity: Identity::Unidentified,
            args: HashMap::new(),
            thread_id: String::new(),
            error: String::new(),
            auto_disconnect: false,
        }
    }

    pub fn request(command: &str, to: Node) -> Self {
        let mut msg = Message::new(MessageKind::Request);
        msg.command = command.to_owned();
        msg.to = to;
        msg
    }

    pub fn reply(command: &str, to: Node) -> Self {
        let mut msg = Message::new(MessageKind::Reply);
        msg.command = command.to_owned();
        msg.to = to;
        msg
    }

    pub fn with_arg(mut self, key: &str, value: impl ToString) -> Self {
        self.args.insert(key.to_owned(), value.to_string());
        self
    }

    pub fn with_auto_disconnect(mut self) -> Self {
        self.auto_disconnect = true;
        self
    }

    #[inline]
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(|s| s.as_str())
    }

    /// Parses a numeric argument, treating a missing or malformed value as `None`.
    pub fn arg_usize(&self, key: &str) -> Option<usize> {
        self.arg(key).and_then(|v| v.trim().parse().ok())
    }

    /// Stores `items` as `<prefix>0..<prefix>n` together with `count_key = n`.
    pub fn set_list<S: AsRef<str>>(&mut self, count_key: &str, prefix: &str, items: &[S]) {
        for (i, item) in items.iter().enumerate() {
            self.args
                .insert(format!("{}{}", prefix, i), item.as_ref().to_owned());
        }
        self.args.insert(count_key.to_owned(), items.len().to_string());
    }

    /// Reads back a list written by [`Message::set_list`]. Holes are skipped.
    pub fn list(&self, count_key: &str, prefix: &str) -> Vec<String> {
        let count = self.arg_usize(count_key).unwrap_or(0);
        (0..count)
            .filter_map(|i| self.arg(&format!("{}{}", prefix, i)).map(|s| s.to_owned()))
            .collect()
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}({}) {} -> {} [{} args]",
            self.kind,
            self.command,
            self.from,
            self.to,
            self.args.len()
        )
    }
}
