use crate::command::MAX_FRAME_LEN;
use crate::{Error, Node, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::convert::TryInto;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

/// Attempts made before a peer is declared unreachable.
pub const MAX_CONNECT_ATTEMPTS: usize = 5;
/// Pause between two attempts.
pub const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

pub fn read_be_u64(input: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&input[..8]);
    u64::from_be_bytes(buf)
}

// These APIs below require a socket in blocking state

pub fn read_payload_len(stream: &mut TcpStream) -> Result<u64> {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf)?;
    Ok(read_be_u64(&buf))
}

/// Refuses a length prefix above [`MAX_FRAME_LEN`] before anything is allocated for it.
pub fn check_frame_len(len: u64) -> Result<usize> {
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }
    len.try_into().map_err(|_| Error::FrameTooLarge(len))
}

pub fn recv_message_sync(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let payload_len = check_frame_len(read_payload_len(stream)?)?;
    let mut buf = vec![0u8; payload_len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn send_message_sync(stream: &mut TcpStream, buf: &[u8]) -> Result<()> {
    let len_buf = (buf.len() as u64).to_be_bytes();
    stream.write_all(&len_buf)?;
    stream.write_all(buf)?;
    stream.flush()?;
    Ok(())
}

pub fn recv_cmd_sync<T: DeserializeOwned>(stream: &mut TcpStream) -> Result<T> {
    let buf = recv_message_sync(stream)?;
    let cmd = bincode::deserialize(&buf)?;
    Ok(cmd)
}

pub fn send_cmd_sync(stream: &mut TcpStream, cmd: &impl Serialize) -> Result<()> {
    let buf = bincode::serialize(cmd)?;
    send_message_sync(stream, &buf)
}

/// Runs `attempt` up to [`MAX_CONNECT_ATTEMPTS`] times with a fixed backoff between tries.
pub fn with_retry<T, F>(node: &Node, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut tries = 0;
    loop {
        match attempt() {
            Ok(v) => return Ok(v),
            Err(e) => {
                tries += 1;
                if tries >= MAX_CONNECT_ATTEMPTS {
                    log::warn!("failed to reach {} after {} attempts: {}", node, tries, e);
                    return Err(Error::Unreachable(node.clone(), tries));
                }
                log::debug!("failed to reach {}: {}, waiting to try again", node, e);
                std::thread::sleep(CONNECT_BACKOFF);
            }
        }
    }
}

/// Binds the listening socket of a node, retrying like an outbound connect.
pub fn bind_retry(node: &Node) -> Result<TcpListener> {
    with_retry(node, || Ok(TcpListener::bind(("0.0.0.0", node.port))?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let got: Vec<String> = recv_cmd_sync(&mut stream).unwrap();
            send_cmd_sync(&mut stream, &got.len()).unwrap();
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        send_cmd_sync(&mut stream, &vec!["a".to_owned(), "b".to_owned()]).unwrap();
        let n: usize = recv_cmd_sync(&mut stream).unwrap();
        assert_eq!(n, 2);
        handle.join().unwrap();
    }

    #[test]
    fn oversized_prefix_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            recv_message_sync(&mut stream)
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let res = handle.join().unwrap();
        assert!(matches!(res, Err(Error::FrameTooLarge(_))), "{:?}", res);

        assert_eq!(check_frame_len(MAX_FRAME_LEN).unwrap(), MAX_FRAME_LEN as usize);
        assert!(check_frame_len(MAX_FRAME_LEN + 1).is_err());
    }

    #[test]
    fn retry_gives_up() {
        let node = Node::new("127.0.0.1", 1);
        let mut calls = 0;
        let res: Result<()> = with_retry(&node, || {
            calls += 1;
            Err(Error::ConnectionLost)
        });
        assert!(matches!(res, Err(Error::Unreachable(_, 5))));
        assert_eq!(calls, MAX_CONNECT_ATTEMPTS);
    }
}
