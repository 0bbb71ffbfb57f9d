//! Vendor transport seam and the TCP codec behind it.
//!
//! The session is generic over [`VendorTransport`]; production dials the
//! brokerage gateway over TCP with length-prefixed JSON frames standing in
//! for the vendor SDK codec, tests script an in-memory connection
//! (see [`crate::testing`]).

use async_trait::async_trait;
use common::upstream::{UpstreamEvent, UpstreamRequest};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::TransportError;

/// Hard cap on a single wire frame.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Factory for vendor connections. `connect` is called once per reconnect
/// cycle and yields the write and read halves of a fresh connection.
#[async_trait]
pub trait VendorTransport: Send + Sync + 'static {
    type Sink: VendorSink;
    type Stream: VendorStream;

    async fn connect(&self) -> Result<(Self::Sink, Self::Stream), TransportError>;
}

/// Outbound half of a vendor connection.
#[async_trait]
pub trait VendorSink: Send + 'static {
    async fn send(&mut self, request: UpstreamRequest) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Inbound half of a vendor connection. `Ok(None)` means the peer closed.
#[async_trait]
pub trait VendorStream: Send + 'static {
    async fn recv(&mut self) -> Result<Option<UpstreamEvent>, TransportError>;
}

/// TCP transport speaking length-prefixed JSON frames.
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
        }
    }
}

#[async_trait]
impl VendorTransport for TcpTransport {
    type Sink = FrameSink<OwnedWriteHalf>;
    type Stream = FrameStream<OwnedReadHalf>;

    async fn connect(&self) -> Result<(Self::Sink, Self::Stream), TransportError> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok((FrameSink::new(write), FrameStream::new(read)))
    }
}

/// Writes requests as `u32` big-endian length + JSON payload.
pub struct FrameSink<W> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> FrameSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> VendorSink for FrameSink<W> {
    async fn send(&mut self, request: UpstreamRequest) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(&request)?;
        if payload.len() > MAX_FRAME_BYTES {
            return Err(TransportError::FrameTooLarge(payload.len()));
        }
        self.writer.write_u32(payload.len() as u32).await?;
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Reads frames written in the [`FrameSink`] format.
pub struct FrameStream<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin + Send + 'static> FrameStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> VendorStream for FrameStream<R> {
    async fn recv(&mut self) -> Result<Option<UpstreamEvent>, TransportError> {
        let len = match self.reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > MAX_FRAME_BYTES {
            return Err(TransportError::FrameTooLarge(len));
        }
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload).await?;
        Ok(Some(serde_json::from_slice(&payload)?))
    }
}
