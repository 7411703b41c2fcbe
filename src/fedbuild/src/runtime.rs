use crate::command::{arg, NOTIFICATION};
use crate::config::NodeConfig;
use litemsg::receiver::UploadRouter;
use litemsg::{Comm, HandoffQueue, Message, MessageKind, Node, Outbox};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;

/// Node-specific logic driven by the message pump.
pub trait Handler {
    fn handle(&mut self, out: &dyn Outbox, msg: Message) -> anyhow::Result<()>;

    /// Runs once when the node is asked to shut down.
    fn on_shutdown(&mut self, _out: &dyn Outbox) {}
}

/// Feeds inbound messages to `handler` until a `CloseReceiver` arrives.
///
/// A failing or panicking handler only loses the message at hand.
pub fn pump<H: Handler + ?Sized>(
    inbound: &HandoffQueue<Message>,
    out: &dyn Outbox,
    handler: &mut H,
    shutdown: &AtomicBool,
) {
    loop {
        let msg = inbound.dequeue();
        match msg.kind {
            MessageKind::Connect => {
                log::trace!("connect from {}", msg.from);
            }
            MessageKind::CloseReceiver => {
                log::info!("{} asked {} to shut down", msg.from, out.local());
                shutdown.store(true, SeqCst);
                handler.on_shutdown(out);
                break;
            }
            _ => {
                let summary = msg.to_string();
                log::debug!("handling {}", summary);
                match catch_unwind(AssertUnwindSafe(|| handler.handle(out, msg))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::error!("failed to handle {}: {:?}", summary, e),
                    Err(panic) => log::error!(
                        "handler panicked on {}: {}",
                        summary,
                        panic_message(panic.as_ref())
                    ),
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// The transport of one node plus its shutdown flag.
pub struct NodeRuntime {
    comm: Comm,
    shutdown: Arc<AtomicBool>,
}

impl NodeRuntime {
    /// Binds the node's listener. Failing here is fatal for the node.
    pub fn start(node: &NodeConfig, router: Arc<dyn UploadRouter>) -> anyhow::Result<NodeRuntime> {
        let comm = Comm::start(node.identity, &node.service_url(), router)?;
        log::info!("{} is up at {}", comm.identity(), comm.local());
        Ok(NodeRuntime {
            comm,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    #[inline]
    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    /// Runs the pump on the calling thread, then flushes and stops the transport.
    pub fn run<H: Handler + ?Sized>(mut self, handler: &mut H) {
        pump(self.comm.inbound(), &self.comm, handler, &self.shutdown);
        // stops the delivery thread once everything queued so far went out
        self.comm.close();
        log::info!("node at {} stopped", self.comm.local());
    }
}

/// Fire-and-forget progress text for a client.
pub fn notify(out: &dyn Outbox, client: &Node, text: impl Into<String>) {
    let text = text.into();
    if client.is_unset() {
        log::debug!("no client to tell: {}", text);
        return;
    }
    log::info!("notify {}: {}", client, text);
    out.post(
        Message::request(NOTIFICATION, client.clone())
            .with_arg(arg::NOTIFMSG, text)
            .with_auto_disconnect(),
    );
}

/// Reads the return address a message carries, falling back to its sender.
pub fn client_of(msg: &Message) -> Node {
    msg.arg(arg::CLIENTDETAILS)
        .and_then(|c| c.parse().ok())
        .unwrap_or_else(|| msg.from.clone())
}
