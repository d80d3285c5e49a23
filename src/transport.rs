//! The byte stream capability a [`Session`](crate::session::Session) runs on.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A bidirectional byte stream owned by a session.
///
/// `send` reports how many bytes of `buf` the transport accepted. The session treats anything
/// other than the full buffer as a failure.
///
/// `receive` must be cancellation safe: the session polls it alongside its timers and drops the
/// future when a timer fires first. Returning `Ok(0)` signals that the peer closed the stream.
///
/// `close` may be called once by the session; implementations should make repeated calls a no-op.
pub trait Transport: Send {
    fn send(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

    fn receive(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// A [`Transport`] over any tokio stream, e.g. a TCP, TLS or WebSocket bridge stream.
///
/// [`AsyncRead`] must be cancellation safe, as it is for the tokio networking types.
#[derive(Debug)]
pub struct IoTransport<T> {
    stream: T,
    closed: bool,
}

impl<T> IoTransport<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}

impl<T> Transport for IoTransport<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.stream.write_all(buf).await?;
        self.stream.flush().await?;
        Ok(buf.len())
    }

    async fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        self.stream.read(buf).await
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream.shutdown().await
    }
}
