//! Inbound socket plumbing shared by the listener and the WebSocket relay.

use bytes::{Buf, Bytes};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Facts about the connection a request arrived on. The listener stores one
/// in every request's extensions.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub remote_addr: Option<SocketAddr>,
    /// The connection went through the TLS acceptor.
    pub encrypted: bool,
}

/// A bidirectional byte stream that can be placed into relay mode.
pub trait ProxySocket: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Prepares a long-lived, latency-sensitive relay: Nagle off, TCP
    /// keep-alive on. Streams without socket options ignore this.
    fn setup(&mut self) {}
}

pub type BoxSocket = Box<dyn ProxySocket>;

impl ProxySocket for TcpStream {
    fn setup(&mut self) {
        if let Err(e) = self.set_nodelay(true) {
            log::debug!("Failed to disable Nagle on relay socket: {}", e);
        }
        if let Err(e) = socket2::SockRef::from(&*self).set_keepalive(true) {
            log::debug!("Failed to enable keep-alive on relay socket: {}", e);
        }
    }
}

impl ProxySocket for tokio_rustls::server::TlsStream<TcpStream> {
    fn setup(&mut self) {
        self.get_mut().0.setup();
    }
}

impl ProxySocket for tokio::io::DuplexStream {}

impl<S: ProxySocket> ProxySocket for Rewind<S> {
    fn setup(&mut self) {
        self.inner.setup();
    }
}

impl ProxySocket for BoxSocket {
    fn setup(&mut self) {
        (**self).setup();
    }
}

/// A stream that yields `prefix` before reading from `inner` again.
///
/// Used to push already-consumed bytes back onto a socket: the pre-upgrade
/// head of a WebSocket request, or a request head sniffed by the listener.
pub struct Rewind<S> {
    prefix: Option<Bytes>,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        let prefix = if prefix.is_empty() { None } else { Some(prefix) };
        Self { prefix, inner }
    }

    pub fn into_inner(self) -> (Option<Bytes>, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            if !prefix.is_empty() {
                let n = prefix.len().min(buf.remaining());
                buf.put_slice(&prefix[..n]);
                prefix.advance(n);
                if !prefix.is_empty() {
                    self.prefix = Some(prefix);
                }
                return Poll::Ready(Ok(()));
            }
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
