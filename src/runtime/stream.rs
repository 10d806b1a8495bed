use std::{
    net::SocketAddr,
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use super::tls::TlsConfig;
use crate::{
    error::{ErrorKind, Result},
    options::{ServerAddress, SocketOptions},
};

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// A duplex byte stream to a server, possibly using TLS.
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// A placeholder stream that swallows writes and reports EOF on read. Used
    /// where a connection object is needed without a live socket.
    Null,

    /// A plain TCP connection to the server.
    Tcp(TcpStream),

    /// A TLS session over TCP.
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),

    /// An in-memory stream used to drive the wire protocol in tests.
    #[cfg(test)]
    Memory(tokio::io::DuplexStream),
}

impl AsyncStream {
    /// Connects to the given address, resolving all endpoints for the name and
    /// attempting each in sequence. Wrapping this future in a timeout drops any
    /// in-flight socket, so a timed-out connect cannot leak a descriptor.
    pub(crate) async fn connect(
        address: &ServerAddress,
        tls_config: Option<&TlsConfig>,
        options: &SocketOptions,
    ) -> Result<Self> {
        let inner = tcp_connect(address, options).await?;

        match tls_config {
            Some(cfg) => {
                let host = cfg.sni_host().unwrap_or_else(|| address.host());
                let session = cfg.begin_handshake(host, inner).await?;
                Ok(Self::Tls(Box::new(session)))
            }
            None => Ok(Self::Tcp(inner)),
        }
    }
}

async fn tcp_connect(address: &ServerAddress, options: &SocketOptions) -> Result<TcpStream> {
    let mut socket_addrs: Vec<SocketAddr> = resolve(address).await?;

    if socket_addrs.is_empty() {
        return Err(ErrorKind::DnsResolve {
            message: format!("no addresses found for {}", address),
        }
        .into());
    }

    // Try each of the addresses in sequence with a preference for IPv4, the
    // same order other drivers use.
    socket_addrs.sort_by_key(|addr| if addr.is_ipv4() { 0 } else { 1 });

    let mut connect_error = None;

    for socket_addr in &socket_addrs {
        connect_error = match try_connect(socket_addr, options).await {
            Ok(stream) => return Ok(stream),
            Err(err) => Some(err),
        };
    }

    // The loop ran at least once, so an error is always present here.
    Err(connect_error.unwrap_or_else(|| {
        ErrorKind::DnsResolve {
            message: format!("no addresses found for {}", address),
        }
        .into()
    }))
}

async fn resolve(address: &ServerAddress) -> Result<Vec<SocketAddr>> {
    tokio::net::lookup_host((address.host(), address.port()))
        .await
        .map(|addrs| addrs.collect())
        .map_err(|e| {
            ErrorKind::DnsResolve {
                message: format!("could not resolve {}: {}", address, e),
            }
            .into()
        })
}

async fn try_connect(address: &SocketAddr, options: &SocketOptions) -> Result<TcpStream> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;

    let socket = socket2::Socket::from(stream.into_std()?);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(options.keep_alive_time.unwrap_or(KEEPALIVE_TIME));
    socket.set_tcp_keepalive(&keepalive)?;
    if let Some(size) = options.receive_buffer_size {
        socket.set_recv_buffer_size(size as usize)?;
    }
    if let Some(size) = options.send_buffer_size {
        socket.set_send_buffer_size(size as usize)?;
    }
    let std_stream = std::net::TcpStream::from(socket);
    Ok(TcpStream::from_std(std_stream)?)
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_read(cx, buf),
            #[cfg(test)]
            Self::Memory(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(buf.len())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_write(cx, buf),
            #[cfg(test)]
            Self::Memory(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_flush(cx),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_flush(cx),
            #[cfg(test)]
            Self::Memory(ref mut inner) => Pin::new(inner).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Null => Poll::Ready(Ok(())),
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_shutdown(cx),
            #[cfg(test)]
            Self::Memory(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
        }
    }
}
