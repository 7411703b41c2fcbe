use crate::buffer::Buffer;
use crate::{Error, Node, Result};
use mio::net::TcpStream;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::VecDeque;
use std::io::{Read, Write};

/// One side of a framed, non-blocking connection.
///
/// A frame is a big-endian `u64` length followed by a bincode payload.
pub struct Endpoint {
    stream: TcpStream,
    peer: Node,
    tx_queue: VecDeque<Buffer>,
    state: ReceiveState,
    msg_len: Buffer,
    msg_payload: Buffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    RecvLength,
    RecvPayload,
}

impl Endpoint {
    pub fn new(stream: std::net::TcpStream, peer: Node) -> Result<Self> {
        // this will set stream to non-blocking for us
        let stream = TcpStream::from_stream(stream)?;
        Ok(Endpoint {
            stream,
            peer,
            tx_queue: Default::default(),
            state: ReceiveState::RecvLength,
            msg_len: Buffer::with_len(std::mem::size_of::<u64>()),
            msg_payload: Buffer::default(),
        })
    }

    #[inline]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    #[inline]
    pub fn peer(&self) -> &Node {
        &self.peer
    }

    pub fn post(&mut self, cmd: impl Serialize + std::fmt::Debug) -> Result<()> {
        log::trace!("post a cmd: {:?}", cmd);
        let buf = bincode::serialize(&cmd)?;
        let buf_len = (buf.len() as u64).to_be_bytes();
        self.tx_queue.push_back(Buffer::from_vec(buf_len.into()));
        self.tx_queue.push_back(Buffer::from_vec(buf));
        Ok(())
    }

    /// Writes as much of the queued data as the socket accepts.
    pub fn on_send_ready(&mut self) -> Result<()> {
        if self.tx_queue.is_empty() {
            return Err(Error::NothingToSend);
        }

        while let Some(buffer) = self.tx_queue.front_mut() {
            if buffer.is_clear() {
                self.tx_queue.pop_front();
                continue;
            }

            Self::send_buffer(&mut self.stream, buffer)?;
        }

        Ok(())
    }

    /// Reads until one whole frame is available, or returns `WouldBlock` with
    /// the partial frame kept for the next call.
    pub fn on_recv_ready<T: DeserializeOwned + std::fmt::Debug>(&mut self) -> Result<T> {
        use ReceiveState::*;
        match self.state {
            RecvLength => {
                self.recv_msg_length()?;
                self.recv_msg_payload()?;
            }
            RecvPayload => {
                self.recv_msg_payload()?;
            }
        }

        // here we get an entire message
        let msg = self.msg_payload.as_slice();
        let cmd = bincode::deserialize(msg)?;
        log::trace!("on_recv_ready: cmd: {:?}", cmd);

        Ok(cmd)
    }

    fn recv_buffer(stream: &mut TcpStream, buffer: &mut Buffer) -> Result<usize> {
        let buf = buffer.get_remain_buffer_mut();
        if buf.is_empty() {
            return Ok(0);
        }
        match stream.read(buf) {
            Ok(0) => Err(Error::ConnectionLost),
            Ok(nbytes) => {
                buffer.mark_handled(nbytes);
                Ok(nbytes)
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::WouldBlock),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn send_buffer(stream: &mut TcpStream, buffer: &mut Buffer) -> Result<usize> {
        let buf = buffer.get_remain_buffer();
        match stream.write(buf) {
            Ok(nbytes) => {
                buffer.mark_handled(nbytes);
                Ok(nbytes)
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::WouldBlock),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn recv_msg_length(&mut self) -> Result<()> {
        loop {
            Self::recv_buffer(&mut self.stream, &mut self.msg_len)?;

            if self.msg_len.is_clear() {
                // prepare payload
                let payload_len = crate::utils::check_frame_len(crate::utils::read_be_u64(
                    self.msg_len.as_slice(),
                ))?;
                self.msg_payload = Buffer::with_len(payload_len);

                // update state
                self.state = ReceiveState::RecvPayload;
                break Ok(());
            }
        }
    }

    fn recv_msg_payload(&mut self) -> Result<()> {
        loop {
            Self::recv_buffer(&mut self.stream, &mut self.msg_payload)?;

            if self.msg_payload.is_clear() {
                // renew msg_len
                self.msg_len = Buffer::with_len(std::mem::size_of::<u64>());

                // update state
                self.state = ReceiveState::RecvLength;
                break Ok(());
            }
        }
    }
}
