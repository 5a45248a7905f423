//! Plain/TLS stream unification for the KV and HTTP transports.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use shoal_errors::{ErrorKind, ShoalError, ShoalResult};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;

use crate::config::SecurityOptions;

/// A connected socket, either raw TCP or TLS over TCP.
#[derive(Debug)]
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl MaybeTlsStream {
    /// Wrap `stream`, running the TLS handshake when security is enabled.
    pub async fn wrap(
        stream: TcpStream,
        hostname: &str,
        security: &SecurityOptions,
    ) -> ShoalResult<MaybeTlsStream> {
        if !security.enabled {
            return Ok(MaybeTlsStream::Plain(stream));
        }
        let mut builder = native_tls::TlsConnector::builder();
        if security.accept_all_certificates {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        let connector = builder
            .build()
            .map_err(|e| ShoalError::with_source(ErrorKind::ServiceNotAvailable, e))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls = connector
            .connect(hostname, stream)
            .await
            .map_err(|e| ShoalError::with_source(ErrorKind::AuthenticationFailure, e))?;
        Ok(MaybeTlsStream::Tls(tls))
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            MaybeTlsStream::Plain(s) => s.local_addr().ok(),
            MaybeTlsStream::Tls(s) => s.get_ref().get_ref().get_ref().local_addr().ok(),
        }
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            MaybeTlsStream::Plain(s) => s.peer_addr().ok(),
            MaybeTlsStream::Tls(s) => s.get_ref().get_ref().get_ref().peer_addr().ok(),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
