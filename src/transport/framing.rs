//! Length-framed packet I/O over a byte stream.
//!
//! The stream is split once per connection: the reader half lives in the
//! inbound loop, the writer half in the session task. Read errors are
//! classified so the session can tell a malformed packet (ignore it, stay
//! connected) from broken framing or transport failure (drop the
//! connection).

use super::connector::ByteStream;
use crate::protocol::codec::{self, DecodeError};
use crate::protocol::packet::Packet;
use bytes::BytesMut;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::trace;

/// Inbound framing errors.
#[derive(Debug, Error)]
pub enum ReadError {
    /// A single packet violated the protocol; the stream is still aligned
    /// and reading can continue.
    #[error("malformed packet: {0}")]
    Malformed(String),
    /// Packet boundaries can no longer be trusted.
    #[error("framing error: {0}")]
    Framing(String),
    /// The peer closed the stream.
    #[error("connection closed by peer")]
    Closed,
    #[error("read failed")]
    Io(#[from] io::Error),
}

/// Reads whole control packets out of the stream.
pub struct FramedReader {
    io: ReadHalf<Box<dyn ByteStream>>,
    buf: BytesMut,
    max_packet_size: usize,
}

/// Writes control packets to the stream, one flush per packet.
pub struct FramedWriter {
    io: WriteHalf<Box<dyn ByteStream>>,
    buf: BytesMut,
}

/// Split a fresh connection into framed halves.
pub fn split(
    stream: Box<dyn ByteStream>,
    max_packet_size: usize,
) -> (FramedReader, FramedWriter) {
    let (read_half, write_half) = tokio::io::split(stream);
    (
        FramedReader {
            io: read_half,
            buf: BytesMut::with_capacity(4096),
            max_packet_size,
        },
        FramedWriter {
            io: write_half,
            buf: BytesMut::with_capacity(1024),
        },
    )
}

impl FramedReader {
    /// Read the next packet, buffering as many stream reads as needed.
    pub async fn read_packet(&mut self) -> Result<Packet, ReadError> {
        loop {
            match codec::decode(&mut self.buf, self.max_packet_size) {
                Ok(Some(packet)) => {
                    trace!(packet = packet.name(), "packet received");
                    return Ok(packet);
                }
                Ok(None) => {}
                Err(DecodeError::Malformed { packet, reason }) => {
                    return Err(ReadError::Malformed(format!("{packet}: {reason}")));
                }
                Err(DecodeError::Framing(reason)) => {
                    return Err(ReadError::Framing(reason));
                }
            }

            self.buf.reserve(4096);
            let n = self.io.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(ReadError::Closed);
            }
        }
    }
}

impl FramedWriter {
    /// Encode and flush one packet.
    pub async fn write_packet(&mut self, packet: &Packet) -> io::Result<()> {
        self.buf.clear();
        codec::encode(packet, &mut self.buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.io.write_all(&self.buf).await?;
        self.io.flush().await?;
        trace!(packet = packet.name(), bytes = self.buf.len(), "packet sent");
        Ok(())
    }
}
