use crate::receiver::{Receiver, UploadRouter};
use crate::sender::{Sender, SenderHandle};
use crate::{FileTransferArgs, HandoffQueue, Identity, Message, Node, Result};
use std::path::Path;
use std::sync::Arc;

/// The outbound operations node logic depends on.
pub trait Outbox {
    /// The address peers use to reach this node.
    fn local(&self) -> &Node;

    /// Fire-and-forget. Undeliverable messages are logged and dropped.
    fn post(&self, msg: Message);

    /// Blocks until the upload finished or failed.
    fn post_file(&self, path: &Path, to: &Node, args: Option<FileTransferArgs>) -> Result<()>;
}

/// The sender and receiver of one node.
pub struct Comm {
    identity: Identity,
    receiver: Receiver,
    sender: Sender,
}

impl Comm {
    pub fn start(identity: Identity, listen: &Node, router: Arc<dyn UploadRouter>) -> Result<Comm> {
        let receiver = Receiver::start(listen, router)?;
        let sender = Sender::start(receiver.local().clone(), identity)?;
        Ok(Comm {
            identity,
            receiver,
            sender,
        })
    }

    #[inline]
    pub fn identity(&self) -> Identity {
        self.identity
    }

    #[inline]
    pub fn inbound(&self) -> &Arc<HandoffQueue<Message>> {
        self.receiver.queue()
    }

    /// A posting handle that other threads of this node can own.
    #[inline]
    pub fn handle(&self) -> SenderHandle {
        self.sender.handle()
    }

    /// Blocks until a message arrives.
    pub fn get_message(&self) -> Message {
        self.receiver.get_message()
    }

    /// Drains pending outbound traffic, then stops both halves.
    pub fn close(&mut self) {
        self.sender.close();
        self.receiver.close();
    }
}

impl Outbox for Comm {
    fn local(&self) -> &Node {
        self.sender.local()
    }

    fn post(&self, msg: Message) {
        self.sender.post_message(msg);
    }

    fn post_file(&self, path: &Path, to: &Node, args: Option<FileTransferArgs>) -> Result<()> {
        self.sender.post_file(path, to, args)
    }
}

impl Outbox for SenderHandle {
    fn local(&self) -> &Node {
        SenderHandle::local(self)
    }

    fn post(&self, msg: Message) {
        self.post_message(msg);
    }

    fn post_file(&self, path: &Path, to: &Node, args: Option<FileTransferArgs>) -> Result<()> {
        SenderHandle::post_file(self, path, to, args)
    }
}

impl<T: Outbox + ?Sized> Outbox for Arc<T> {
    fn local(&self) -> &Node {
        (**self).local()
    }

    fn post(&self, msg: Message) {
        (**self).post(msg)
    }

    fn post_file(&self, path: &Path, to: &Node, args: Option<FileTransferArgs>) -> Result<()> {
        (**self).post_file(path, to, args)
    }
}
