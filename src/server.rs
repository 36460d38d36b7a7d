//! TCP listener that services exactly one connection.
//!
//! The lifecycle is `Listener::bind` -> `Listener::accept` -> `Connection::serve`.
//! `accept` consumes the listener, so a second connection is never accepted;
//! the socket itself stays open inside the connection and later connection
//! attempts sit in the backlog unread.

use crate::config::DisconnectPolicy;
use crate::framing::{self, ParseResult, STARTUP_MESSAGE};
use bytes::BytesMut;
use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

/// Fixed listening address: port 8000 on all interfaces.
pub const LISTEN_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8000);

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

const LISTEN_BACKLOG: i32 = 128;

/// Write the startup line.
pub async fn announce<W>(out: &mut W) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(STARTUP_MESSAGE)
        .await
        .map_err(ServerError::Output)?;
    out.flush().await.map_err(ServerError::Output)
}

/// A bound listening socket that has not accepted yet.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind and start listening on `addr`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr) -> Result<Self, ServerError> {
        let inner = create_listener(addr)
            .and_then(TcpListener::from_std)
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(address = %addr, "Listening");
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Wait for the first inbound connection.
    pub async fn accept(self) -> Result<Connection<TcpStream>, ServerError> {
        let (stream, peer) = self.inner.accept().await.map_err(ServerError::Accept)?;
        info!(peer = %peer, "Accepted connection");

        let mut conn = Connection::new(stream);
        conn.peer = Some(peer);
        conn._listener = Some(self.inner);
        Ok(conn)
    }
}

/// The single serviced connection and its pending line bytes.
pub struct Connection<R> {
    reader: R,
    peer: Option<SocketAddr>,
    buffer: BytesMut,
    /// Held open for the life of the connection; never accepted from again.
    _listener: Option<TcpListener>,
}

impl<R> Connection<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap any byte source. Used directly by tests; the binary goes
    /// through `Listener::accept`.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            peer: None,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            _listener: None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Print every line read from the connection to `out`.
    ///
    /// Never returns `Ok`. What happens once the peer closes or a read fails
    /// is decided by `policy`; any trailing bytes without a newline are
    /// printed first in every case.
    pub async fn serve<W>(
        mut self,
        out: &mut W,
        policy: DisconnectPolicy,
    ) -> Result<Infallible, ServerError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut message = BytesMut::with_capacity(BUFFER_SIZE);
        debug!(peer = ?self.peer, ?policy, "Entering read loop");

        loop {
            while let ParseResult::Complete(len) = framing::parse(&self.buffer) {
                let line = self.buffer.split_to(len);
                trace!(len, "Line received");
                emit(out, &line, &mut message).await?;
            }

            match self.reader.read_buf(&mut self.buffer).await {
                Ok(0) => {
                    info!(peer = ?self.peer, "Connection closed by peer");
                    return self.finish(out, &mut message, policy, None).await;
                }
                Ok(n) => trace!(n, buffered = self.buffer.len(), "Read"),
                Err(e) => {
                    warn!(peer = ?self.peer, error = %e, "Read failed");
                    return self.finish(out, &mut message, policy, Some(e)).await;
                }
            }
        }
    }

    async fn finish<W>(
        &mut self,
        out: &mut W,
        message: &mut BytesMut,
        policy: DisconnectPolicy,
        cause: Option<io::Error>,
    ) -> Result<Infallible, ServerError>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.buffer.is_empty() {
            let partial = self.buffer.split();
            trace!(len = partial.len(), "Flushing unterminated line");
            emit(out, &partial, message).await?;
        }

        match policy {
            DisconnectPolicy::Exit => Err(match cause {
                Some(e) => ServerError::Read(e),
                None => ServerError::ConnectionClosed,
            }),
            DisconnectPolicy::Idle => {
                info!("No more input; idling until terminated");
                Ok(std::future::pending::<Infallible>().await)
            }
            DisconnectPolicy::Spin => {
                debug!("No more input; printing empty messages");
                loop {
                    emit(out, b"", message).await?;
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}

/// Encode one labelled message and write it through to `out`.
async fn emit<W>(out: &mut W, line: &[u8], message: &mut BytesMut) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    message.clear();
    framing::encode_message(line, message);
    out.write_all(message).await.map_err(ServerError::Output)?;
    out.flush().await.map_err(ServerError::Output)
}

/// Create a TCP listener with SO_REUSEADDR so restarts are not blocked by
/// connections lingering in TIME_WAIT.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Listener errors
#[derive(Debug)]
pub enum ServerError {
    Bind { addr: SocketAddr, source: io::Error },
    Accept(io::Error),
    Read(io::Error),
    ConnectionClosed,
    Output(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind { addr, source } => {
                write!(f, "Failed to bind {}: {}", addr, source)
            }
            ServerError::Accept(e) => write!(f, "Failed to accept connection: {}", e),
            ServerError::Read(e) => write!(f, "Failed to read from connection: {}", e),
            ServerError::ConnectionClosed => write!(f, "Connection closed by peer"),
            ServerError::Output(e) => write!(f, "Failed to write to stdout: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Accept(e) | ServerError::Read(e) | ServerError::Output(e) => Some(e),
            ServerError::ConnectionClosed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::time::timeout;
    use tokio_test::io::Builder;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn serve_to_end(reader: tokio_test::io::Mock) -> (Vec<u8>, ServerError) {
        let mut out = Vec::new();
        let err = match Connection::new(reader)
            .serve(&mut out, DisconnectPolicy::Exit)
            .await
        {
            Ok(never) => match never {},
            Err(e) => e,
        };
        (out, err)
    }

    #[tokio::test]
    async fn test_announce() {
        let mut out = Vec::new();
        announce(&mut out).await.unwrap();
        assert_eq!(out, b"Start server...\n");
    }

    #[tokio::test]
    async fn test_single_line() {
        let reader = Builder::new().read(b"hello\n").build();
        let (out, err) = serve_to_end(reader).await;
        assert_eq!(out, b"Message Received:hello\n");
        assert!(matches!(err, ServerError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_line_split_across_reads() {
        let reader = Builder::new().read(b"abc").read(b"def\n").build();
        let (out, _) = serve_to_end(reader).await;
        assert_eq!(out, b"Message Received:abcdef\n");
    }

    #[tokio::test]
    async fn test_multiple_lines_in_one_read() {
        let reader = Builder::new().read(b"a\nb\n").build();
        let (out, _) = serve_to_end(reader).await;
        assert_eq!(out, b"Message Received:a\nMessage Received:b\n");
    }

    #[tokio::test]
    async fn test_unterminated_line_flushed_on_close() {
        let reader = Builder::new().read(b"one\ntail").build();
        let (out, err) = serve_to_end(reader).await;
        assert_eq!(out, b"Message Received:one\nMessage Received:tail");
        assert!(matches!(err, ServerError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_read_error_surfaces_on_exit() {
        let reader = Builder::new()
            .read(b"x\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (out, err) = serve_to_end(reader).await;
        assert_eq!(out, b"Message Received:x\n");
        match err {
            ServerError::Read(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_never_returns() {
        let reader = Builder::new().read(b"x\n").build();
        let mut out = Vec::new();

        let result = timeout(
            Duration::from_millis(50),
            Connection::new(reader).serve(&mut out, DisconnectPolicy::Idle),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(out, b"Message Received:x\n");
    }

    #[tokio::test]
    async fn test_spin_repeats_empty_messages() {
        let reader = Builder::new().read(b"x\n").build();
        let mut out = Builder::new()
            .write(b"Message Received:x\n")
            .write(b"Message Received:")
            .write(b"Message Received:")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            .build();

        let result = Connection::new(reader)
            .serve(&mut out, DisconnectPolicy::Spin)
            .await;

        assert!(matches!(result, Err(ServerError::Output(_))));
    }

    #[tokio::test]
    async fn test_output_failure() {
        let reader = Builder::new().read(b"hello\n").build();
        let mut out = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            .build();

        let result = Connection::new(reader)
            .serve(&mut out, DisconnectPolicy::Idle)
            .await;

        assert!(matches!(result, Err(ServerError::Output(_))));
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let first = Listener::bind(loopback()).unwrap();
        let addr = first.local_addr().unwrap();

        match Listener::bind(addr) {
            Err(ServerError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
            Err(other) => panic!("unexpected: {:?}", other),
            Ok(_) => panic!("second bind should fail"),
        }
    }

    #[tokio::test]
    async fn test_only_first_connection_is_read() {
        let listener = Listener::bind(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (mut out_w, out_r) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let conn = listener.accept().await?;
            assert!(conn.peer_addr().is_some());
            conn.serve(&mut out_w, DisconnectPolicy::Idle).await
        });

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"second\n").await.unwrap();
        first.write_all(b"first\n").await.unwrap();

        let mut lines = BufReader::new(out_r);
        let mut line = String::new();
        lines.read_line(&mut line).await.unwrap();
        assert_eq!(line, "Message Received:first\n");

        line.clear();
        let more = timeout(Duration::from_millis(100), lines.read_line(&mut line)).await;
        assert!(more.is_err());

        server.abort();
    }

    #[tokio::test]
    async fn test_survives_peer_close() {
        let listener = Listener::bind(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (mut out_w, out_r) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let conn = listener.accept().await?;
            conn.serve(&mut out_w, DisconnectPolicy::Idle).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello\n").await.unwrap();
        drop(client);

        let mut lines = BufReader::new(out_r);
        let mut line = String::new();
        lines.read_line(&mut line).await.unwrap();
        assert_eq!(line, "Message Received:hello\n");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!server.is_finished());
        server.abort();
    }
}
