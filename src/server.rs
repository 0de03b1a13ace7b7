//! TCP server for handling chat connections.
//!
//! Accepts incoming connections, runs one task per connection, and applies
//! parsed commands against the shared registry and broadcaster.

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::protocol::{Command, Response, Verb, SERVER_NICKNAME};
use crate::registry::Registry;
use crate::session::{LineReader, Peer, SessionError, SessionId};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Pause after a transient accept failure
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server errors
#[derive(Debug)]
pub enum ServerError {
    /// Could not create or bind the listening socket
    Bind(SocketAddr, io::Error),
    /// The listener failed in a way that cannot be retried
    Accept(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            ServerError::Accept(e) => write!(f, "Listener failed: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(_, e) | ServerError::Accept(e) => Some(e),
        }
    }
}

/// Limits applied to every session
#[derive(Debug, Clone, Copy)]
struct SessionSettings {
    idle_timeout: Option<Duration>,
    write_timeout: Duration,
    max_line_length: usize,
}

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<Registry>,
    broadcaster: Broadcaster,
    connection_limit: Arc<Semaphore>,
    next_session_id: AtomicU64,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Registry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            registry,
            broadcaster,
            connection_limit,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Bind the configured address and serve until Ctrl-C
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = bind_listener(self.config.listen)
            .map_err(|e| ServerError::Bind(self.config.listen, e))?;
        info!(address = %self.config.listen, "Server listening");

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Accept connections until `shutdown` resolves or the listener fails.
    ///
    /// Each connection runs in its own task; this loop never waits for one
    /// to finish, and returning does not wait for them either.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let result = loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => break Ok(()),
                accepted = self.accept(&listener) => accepted,
            };

            match accepted {
                Ok(Some((stream, addr, permit))) => {
                    let id = SessionId::new(self.next_session_id.fetch_add(1, Ordering::Relaxed));
                    debug!(session = %id, peer = %addr, "New connection");

                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(session = %id, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let (reader, writer) = stream.into_split();
                    let registry = Arc::clone(&self.registry);
                    let broadcaster = self.broadcaster.clone();
                    let settings = self.session_settings();

                    tokio::spawn(async move {
                        handle_session(id, reader, writer, registry, broadcaster, settings).await;
                        debug!(session = %id, peer = %addr, "Connection closed");
                        drop(permit);
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Listener failed, stopping");
                    break Err(ServerError::Accept(e));
                }
            }
        };

        info!(online = self.registry.len(), "Shutting down");
        if !self.registry.is_empty() {
            self.broadcaster
                .broadcast(SERVER_NICKNAME, "server shutting down", false)
                .await;
        }
        result
    }

    /// Wait for a connection slot, then for a connection.
    ///
    /// Transient failures are logged and yield `Ok(None)`.
    async fn accept(
        &self,
        listener: &TcpListener,
    ) -> io::Result<Option<(tokio::net::TcpStream, SocketAddr, tokio::sync::OwnedSemaphorePermit)>>
    {
        let permit = match Arc::clone(&self.connection_limit).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Err(io::Error::other("connection limit closed")),
        };

        match listener.accept().await {
            Ok((stream, addr)) => Ok(Some((stream, addr, permit))),
            Err(e) if is_transient_accept_error(&e) => {
                warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            idle_timeout: self.config.idle_timeout(),
            write_timeout: self.config.write_timeout(),
            max_line_length: self.config.max_line_length,
        }
    }

    /// Get a reference to the registry for testing
    #[cfg(test)]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

/// Create a TCP listener with SO_REUSEADDR.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
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
    socket.listen(BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Errors after which the listener is still usable
fn is_transient_accept_error(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        // Out of descriptors or memory: retry later
        _ => matches!(
            e.raw_os_error(),
            Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
        ),
    }
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Connected,
    Registered { nickname: String },
    Closed,
}

/// What the loop does after a command
enum Flow {
    Continue,
    Stop,
}

/// One connected client
struct Session<R> {
    id: SessionId,
    reader: LineReader<R>,
    peer: Peer,
    state: SessionState,
    registry: Arc<Registry>,
    broadcaster: Broadcaster,
}

/// Run the chat protocol for one connection until it ends.
///
/// Always unregisters the session and closes its connection on the way out.
async fn handle_session<R, W>(
    id: SessionId,
    reader: R,
    writer: W,
    registry: Arc<Registry>,
    broadcaster: Broadcaster,
    settings: SessionSettings,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut session = Session {
        id,
        reader: LineReader::new(reader, settings.idle_timeout, settings.max_line_length),
        peer: Peer::new(id, writer, settings.write_timeout),
        state: SessionState::Connected,
        registry,
        broadcaster,
    };

    if let Err(e) = session.run().await {
        debug!(session = %id, error = %e, "Session ended");
    }
    session.cleanup().await;
}

impl<R: AsyncRead + Unpin> Session<R> {
    async fn run(&mut self) -> Result<(), SessionError> {
        loop {
            let line = match self.reader.read_line().await? {
                Some(line) => line,
                None => {
                    trace!(session = %self.id, "End of stream");
                    return Ok(());
                }
            };

            // Pruned by a broadcast from another session
            if self.peer.is_closed() {
                return Err(SessionError::Closed);
            }

            let command = Command::parse(&line);
            trace!(session = %self.id, ?command, "Processing command");

            if let Flow::Stop = self.execute(command).await? {
                return Ok(());
            }
        }
    }

    async fn execute(&mut self, command: Command) -> Result<Flow, SessionError> {
        match command.verb {
            Verb::Join => {
                match self.registry.register(&self.peer, &command.argument) {
                    Ok(nickname) => {
                        self.peer.send(&Response::ok(&format!("welcome {}", nickname))).await?;
                        self.broadcaster
                            .broadcast(SERVER_NICKNAME, &format!("{} joined", nickname), false)
                            .await;
                        self.state = SessionState::Registered { nickname };
                    }
                    Err(e) => self.peer.send(&Response::error(&e.to_string())).await?,
                }
                Ok(Flow::Continue)
            }

            Verb::Msg => {
                let nickname = match self.registry.nickname_of(self.id) {
                    Some(nickname) => nickname,
                    None => {
                        self.peer.send(&Response::error("join first")).await?;
                        return Ok(Flow::Continue);
                    }
                };
                if command.argument_is_blank() {
                    self.peer.send(&Response::error("empty message")).await?;
                    return Ok(Flow::Continue);
                }

                self.broadcaster.broadcast(&nickname, &command.argument, true).await;
                self.peer.send(&Response::ok("message sent")).await?;
                Ok(Flow::Continue)
            }

            Verb::List => {
                let nicknames = self.registry.nicknames();
                self.peer.send(&Response::users(&nicknames)).await?;
                Ok(Flow::Continue)
            }

            Verb::Quit => {
                let previous = std::mem::replace(&mut self.state, SessionState::Closed);
                self.registry.unregister(self.id);
                // The peer may already be gone; the leave notice goes out regardless
                let bye = self.peer.send(&Response::bye("goodbye")).await;
                if let SessionState::Registered { nickname } = previous {
                    self.announce_leave(&nickname).await;
                }
                bye?;
                Ok(Flow::Stop)
            }

            Verb::Unknown => {
                self.peer.send(&Response::error("unknown command")).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn announce_leave(&self, nickname: &str) {
        self.broadcaster
            .broadcast(SERVER_NICKNAME, &format!("{} left", nickname), false)
            .await;
    }

    /// Runs exactly once, whatever ended the session.
    async fn cleanup(&mut self) {
        self.registry.unregister(self.id);
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        if let SessionState::Registered { nickname } = previous {
            self.announce_leave(&nickname).await;
        }
        self.peer.close().await;
    }
}
