use crate::{FileTransferArgs, Message};
use serde::{Deserialize, Serialize};

/// Size of one file block on the wire. The last block of a file may be shorter.
pub const BLOCK_SIZE: usize = 1024;

/// Largest payload a peer may announce. A frame holds one message or one block.
pub const MAX_FRAME_LEN: u64 = 4 << 20;

/// Frames on a sender-to-receiver connection. Every frame is answered with one [`Ack`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// send by sender, enqueued by receiver
    Post(Message),
    /// (file name, transfer args), the receiving node picks the directory before creating the file
    OpenFile(String, FileTransferArgs),
    /// append to the file opened on this connection
    WriteBlock(#[serde(with = "serde_bytes")] Vec<u8>),
    /// flush and close the file opened on this connection
    CloseFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ack {
    Ok,
    Failed(String),
}

impl Ack {
    pub fn into_result(self) -> crate::Result<()> {
        match self {
            Ack::Ok => Ok(()),
            Ack::Failed(reason) => Err(crate::Error::Rejected(reason)),
        }
    }
}
