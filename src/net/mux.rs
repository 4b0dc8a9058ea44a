//! Connection-level protocol sniffing for shared sockets.
//!
//! # Responsibilities
//! - Read just enough leading bytes of a new connection to tell an HTTP/2
//!   prior-knowledge preface (RPC), a TLS ClientHello and anything else
//!   (HTTP/1) apart
//! - Replay the consumed bytes to whichever server takes the connection
//!
//! # Design Decisions
//! - The decision is made on the shortest distinguishing prefix, so a
//!   short HTTP/1 request line never waits for 24 bytes
//! - Sniffing is bounded by a timeout; silent connections are dropped

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// HTTP/2 connection preface sent by RPC clients.
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// First byte of a TLS handshake record.
const TLS_HANDSHAKE: u8 = 0x16;

/// How long a new connection may stay silent before it is dropped.
pub const SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte stream a server can drive.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Io for T {}

pub type BoxIo = Box<dyn Io>;

/// Where a sniffed connection goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Plaintext HTTP/2 preface: the RPC server.
    Rpc,
    /// Plaintext anything else: the HTTP server.
    Http,
    /// TLS: the secure personality.
    Tls,
}

/// Decide the route from the bytes seen so far. `None` means more bytes are
/// needed.
pub fn classify(prefix: &[u8], secure: bool, insecure: bool) -> Option<Route> {
    if !insecure {
        return Some(Route::Tls);
    }
    let first = *prefix.first()?;
    if secure && first == TLS_HANDSHAKE {
        return Some(Route::Tls);
    }

    let n = prefix.len().min(H2_PREFACE.len());
    if prefix[..n] != H2_PREFACE[..n] {
        return Some(Route::Http);
    }
    if n == H2_PREFACE.len() {
        return Some(Route::Rpc);
    }
    None
}

/// Read from `io` until the route is known. Returns the route and the
/// bytes consumed, which must be replayed.
pub async fn sniff<S>(io: &mut S, secure: bool, insecure: bool) -> io::Result<(Route, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = Vec::with_capacity(H2_PREFACE.len());
    if let Some(route) = classify(&prefix, secure, insecure) {
        return Ok((route, prefix));
    }

    let mut buf = [0u8; 24];
    loop {
        let want = H2_PREFACE.len() - prefix.len();
        let n = io.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before protocol was detected",
            ));
        }
        prefix.extend_from_slice(&buf[..n]);
        if let Some(route) = classify(&prefix, secure, insecure) {
            return Ok((route, prefix));
        }
    }
}

/// A stream that yields `prefix` before reading from `inner`.
pub struct Rewind<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
