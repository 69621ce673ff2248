//! DNS-over-TCP framing: a big-endian u16 length prefix in front of
//! the message, used by [`crate::server`] to know when a whole
//! message has arrived before handing it to a `Responder`.
//!
//! UDP needs no such framing; a datagram is a complete message.

use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// An error reading a DNS TCP message.
#[derive(Debug)]
pub enum TcpError {
    TooShort {
        id: Option<u16>,
        expected: usize,
        actual: usize,
    },
    IO {
        id: Option<u16>,
        error: io::Error,
    },
}

/// Read a length-prefixed DNS message from a TCP stream.
pub async fn read_tcp_bytes(stream: &mut TcpStream) -> Result<BytesMut, TcpError> {
    let size = stream.read_u16().await.map_err(|error| TcpError::IO {
        id: None,
        error,
    })?;
    let expected = size as usize;
    let mut bytes = BytesMut::with_capacity(expected);
    while bytes.len() < expected {
        let id = || {
            if bytes.len() >= 2 {
                Some(u16::from_be_bytes([bytes[0], bytes[1]]))
            } else {
                None
            }
        };
        match stream.read_buf(&mut bytes).await {
            Ok(0) => {
                return Err(TcpError::TooShort {
                    id: id(),
                    expected,
                    actual: bytes.len(),
                })
            }
            Ok(_) => (),
            Err(error) => return Err(TcpError::IO { id: id(), error }),
        }
    }
    Ok(bytes)
}

/// Write a length-prefixed DNS message to a TCP stream.  The TC bit
/// and length cap are the `Responder`'s responsibility; this just
/// frames whatever bytes it is given.
pub async fn send_tcp_bytes(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), io::Error> {
    let len: u16 = bytes.len().try_into().unwrap_or(u16::MAX);
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes[..(len as usize)]).await?;
    Ok(())
}
