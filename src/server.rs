//! TCP server for line retrieval.
//!
//! One listener task accepts connections and spawns one handler task per
//! client. Both the accept and the per-connection read are bounded by a
//! timeout; every expiry is an opportunity to check the shared shutdown flag.
//! This polling is the only way tasks learn about shutdown, so shutdown
//! latency is bounded by one timeout period per idle task.

use crate::config::Config;
use crate::index::Session;
use crate::protocol::{Command, ParseResult, Parser, Response, MAX_FRAME_LENGTH};
use crate::shutdown::Shutdown;
use crate::store::LineStore;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, trace};

/// Listen backlog for the server socket
const LISTEN_BACKLOG: i32 = 1024;

/// Server tuning knobs
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// How long a handler waits for a command before re-checking for shutdown
    pub read_timeout: Duration,
    /// How long the listener waits for a connection before re-checking for shutdown
    pub accept_timeout: Duration,
    /// Maximum concurrently served connections (`None` = unlimited)
    pub max_clients: Option<usize>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            accept_timeout: Duration::from_secs(2),
            max_clients: None,
        }
    }
}

impl From<&Config> for ServerOptions {
    fn from(config: &Config) -> Self {
        Self {
            read_timeout: config.read_timeout,
            accept_timeout: config.accept_timeout,
            max_clients: config.max_clients,
        }
    }
}

/// How a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// Client sent QUIT
    Quit,
    /// Client sent SHUTDOWN, or shutdown was observed on a read timeout
    Shutdown,
    /// Client closed its side
    Disconnected,
    /// Read or write failed
    IoError,
}

/// Source of incoming connections for [`Server::run`].
pub trait Acceptor {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Server instance
pub struct Server {
    session: Arc<Session>,
    shutdown: Arc<Shutdown>,
    options: ServerOptions,
    connection_limit: Option<Arc<Semaphore>>,
}

impl Server {
    /// Create a new server instance
    pub fn new(session: Session, options: ServerOptions) -> Self {
        Self::with_shutdown(session, options, Shutdown::new())
    }

    /// Create a server that shares an existing shutdown state
    pub fn with_shutdown(
        session: Session,
        options: ServerOptions,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        let connection_limit = options
            .max_clients
            .map(|max| Arc::new(Semaphore::new(max.min(Semaphore::MAX_PERMITS))));

        Server {
            session: Arc::new(session),
            shutdown,
            options,
            connection_limit,
        }
    }

    /// Get a reference to the shutdown state for testing
    #[cfg(test)]
    pub fn shutdown(&self) -> &Arc<Shutdown> {
        &self.shutdown
    }

    /// Run the listener until shutdown, then wait for every handler to exit.
    pub async fn serve<A: Acceptor>(&self, listener: A) {
        self.run(listener).await;

        info!(
            in_flight = self.shutdown.in_flight(),
            "Waiting for outstanding connections to exit"
        );
        self.shutdown.wait_all().await;
    }

    /// Accept connections until shutdown. The listener counts as one
    /// in-flight task while this runs.
    ///
    /// Any accept error other than a timeout initiates shutdown.
    pub async fn run<A: Acceptor>(&self, listener: A) {
        let _listening = self.shutdown.track();

        match listener.local_addr() {
            Ok(addr) => info!(address = %addr, "Server listening"),
            Err(e) => debug!(error = %e, "Listener has no local address"),
        }

        while !self.shutdown.is_shutting_down() {
            match timeout(self.options.accept_timeout, self.next_connection(&listener)).await {
                // Timeout: re-check the flag
                Err(_) => continue,
                Ok(Ok((stream, peer, permit))) => self.spawn_handler(stream, peer, permit),
                Ok(Err(e)) => {
                    error!(error = %e, "Failed to accept connection");
                    self.shutdown.initiate_shutdown();
                }
            }
        }

        info!("Listener received shutdown signal, closing");
    }

    /// Wait for a connection slot, then for a connection.
    async fn next_connection<A: Acceptor>(
        &self,
        listener: &A,
    ) -> io::Result<(A::Stream, SocketAddr, Option<OwnedSemaphorePermit>)> {
        let permit = match &self.connection_limit {
            Some(limit) => Some(
                Arc::clone(limit)
                    .acquire_owned()
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
            ),
            None => None,
        };

        let (stream, peer) = listener.accept().await?;
        Ok((stream, peer, permit))
    }

    fn spawn_handler<S>(&self, stream: S, peer: SocketAddr, permit: Option<OwnedSemaphorePermit>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug!(peer = %peer, "New connection");

        // Counted before spawning so wait_all never sees a gap
        let in_flight = self.shutdown.track();
        let session = Arc::clone(&self.session);
        let shutdown = Arc::clone(&self.shutdown);
        let read_timeout = self.options.read_timeout;

        tokio::spawn(async move {
            let end = handle_connection(stream, &session, &shutdown, read_timeout).await;
            debug!(peer = %peer, ?end, "Closing connection");
            drop(permit);
            drop(in_flight);
        });
    }
}

/// Outcome of reading one frame
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    /// A full frame ending in `\n` is in the buffer
    Complete,
    /// The buffer hit [`MAX_FRAME_LENGTH`] without a terminator
    TooLong,
    /// Peer closed the connection
    Eof,
}

/// Serve one client until it quits, disconnects, fails, or shutdown is observed.
pub async fn handle_connection<S>(
    stream: S,
    session: &Session,
    shutdown: &Shutdown,
    read_timeout: Duration,
) -> ConnectionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut store = match LineStore::open(session) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Failed to open line store");
            return ConnectionEnd::IoError;
        }
    };

    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut frame = Vec::with_capacity(MAX_FRAME_LENGTH);
    // Set while skipping the rest of an over-long frame
    let mut discarding = false;

    loop {
        let read = match timeout(read_timeout, read_frame(&mut reader, &mut frame)).await {
            Err(_) => {
                // Partial frame bytes stay in `frame` for the next attempt
                if shutdown.is_shutting_down() {
                    debug!("Connection received shutdown signal");
                    return ConnectionEnd::Shutdown;
                }
                continue;
            }
            Ok(read) => read,
        };

        let response: Bytes = match read {
            Err(e) => {
                debug!(error = %e, "Connection read error");
                return ConnectionEnd::IoError;
            }
            Ok(Frame::Eof) => {
                trace!("Connection closed by client");
                return ConnectionEnd::Disconnected;
            }
            Ok(Frame::TooLong) => {
                frame.clear();
                if discarding {
                    continue;
                }
                discarding = true;
                trace!("Frame too long");
                Bytes::from_static(Response::error())
            }
            Ok(Frame::Complete) if discarding => {
                frame.clear();
                discarding = false;
                continue;
            }
            Ok(Frame::Complete) => {
                let parsed = Parser::parse(&frame);
                frame.clear();

                match parsed {
                    ParseResult::Invalid(e) => {
                        trace!(error = %e, "Invalid command");
                        Bytes::from_static(Response::error())
                    }
                    ParseResult::Complete(Command::Quit) => {
                        trace!("QUIT");
                        return ConnectionEnd::Quit;
                    }
                    ParseResult::Complete(Command::Shutdown) => {
                        trace!("SHUTDOWN");
                        shutdown.initiate_shutdown();
                        return ConnectionEnd::Shutdown;
                    }
                    ParseResult::Complete(Command::Get { line }) => {
                        trace!(line, "GET");
                        let text = match fetch_line(store, line).await {
                            Ok((returned, text)) => {
                                store = returned;
                                text
                            }
                            Err(e) => {
                                error!(error = %e, "Line lookup task failed");
                                return ConnectionEnd::IoError;
                            }
                        };
                        match text {
                            Some(text) => Response::line(&text).freeze(),
                            None => Bytes::from_static(Response::error()),
                        }
                    }
                }
            }
        };

        if let Err(e) = writer.write_all(&response).await {
            debug!(error = %e, "Connection write error");
            return ConnectionEnd::IoError;
        }
    }
}

/// Look up `line` on the blocking pool so a long read never holds a
/// runtime worker. The store is handed back for the next request.
async fn fetch_line(mut store: LineStore, line: u64) -> io::Result<(LineStore, Option<Bytes>)> {
    tokio::task::spawn_blocking(move || {
        let text = store.get_line(line);
        (store, text)
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

/// Read up to and including the next `\n`, appending to `frame`.
///
/// Cancel safe: bytes consumed before a timeout remain in `frame`.
async fn read_frame<R>(reader: &mut R, frame: &mut Vec<u8>) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_FRAME_LENGTH.saturating_sub(frame.len()) as u64;
    (&mut *reader).take(limit).read_until(b'\n', frame).await?;

    if frame.ends_with(b"\n") {
        Ok(Frame::Complete)
    } else if frame.len() >= MAX_FRAME_LENGTH {
        Ok(Frame::TooLong)
    } else {
        // Peer closed, possibly mid-frame
        Ok(Frame::Eof)
    }
}

/// Bind an IPv4/IPv6 listening socket with address reuse enabled.
pub fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
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
