//! NanoServe Server
//!
//! A single-threaded reactor: one listening socket, one readiness
//! multiplexer and the set of live sessions. Decoded frames are handed to
//! the router; application code observes the lifecycle through
//! [`ServerHooks`].

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::router::{Dispatch, Router, RouterError};
use super::session::{
    ConnectionError, ReadProgress, Session, SessionId, SessionState, SessionTable, WriteStatus,
};
use super::ReactorConfig;
use crate::protocol::Frame;

/// Token reserved for the listening socket; session tokens are their ids
const LISTENER: Token = Token(0);

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid bind address: {0}")]
    InvalidAddress(String),

    #[error("Bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Listen failed: {0}")]
    Listen(#[source] io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error(transparent)]
    Handler(#[from] RouterError),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Application override points. Every hook defaults to a no-op.
pub trait ServerHooks {
    /// The listener is bound and registered
    fn on_startup(&mut self, _local_addr: SocketAddr) {}

    /// The listener and multiplexer are closed
    fn on_shutdown(&mut self) {}

    /// A session was accepted and registered
    fn on_connect(&mut self, _session: &mut Session) {}

    /// A session was deregistered and closed; it is dropped right after
    fn on_disconnect(&mut self, _session: &Session) {}

    /// A frame was decoded and routed
    fn on_read(&mut self, _frame: &Frame, _session: &mut Session) {}

    /// A staged frame was fully flushed
    fn on_write(&mut self, _bytes: &[u8], _session: &Session) {}

    /// Runs at the start of every tick, before the multiplexer wait
    fn main_tick(&mut self, _sessions: &mut SessionTable) {}
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ServerHooks for NoHooks {}

/// Lifecycle of the reactor itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Running,
    Stopped,
}

/// Readiness of one token, copied out of the event buffer
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
}

/// NanoServe Server
pub struct Server<H: ServerHooks = NoHooks> {
    /// Name used in log lines
    name: String,
    config: ReactorConfig,
    router: Router,
    hooks: H,
    poll: Option<Poll>,
    events: Events,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    /// Live sessions
    sessions: SessionTable,
    next_session_id: SessionId,
    state: ServerState,
    /// Set from signal handlers or other threads to stop `run`
    shutdown_flag: Arc<AtomicBool>,
}

impl<H: ServerHooks> Server<H> {
    /// Create a new server
    pub fn new(name: impl Into<String>, config: ReactorConfig, router: Router, hooks: H) -> Self {
        let events = Events::with_capacity(config.events_capacity);

        Self {
            name: name.into(),
            config,
            router,
            hooks,
            poll: None,
            events,
            listener: None,
            local_addr: None,
            sessions: SessionTable::new(),
            next_session_id: 1,
            state: ServerState::Idle,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind, listen and register the listening socket
    pub fn start(&mut self, bind_address: &str) -> ServerResult<SocketAddr> {
        if self.state == ServerState::Running {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = bind_address
            .to_socket_addrs()
            .map_err(|e| ServerError::InvalidAddress(format!("{}: {}", bind_address, e)))?
            .next()
            .ok_or_else(|| ServerError::InvalidAddress(bind_address.to_string()))?;

        let mut listener =
            TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let poll = Poll::new().map_err(ServerError::Listen)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ServerError::Listen)?;
        let local_addr = listener.local_addr().map_err(ServerError::Listen)?;

        self.poll = Some(poll);
        self.listener = Some(listener);
        self.local_addr = Some(local_addr);
        self.state = ServerState::Running;
        self.shutdown_flag.store(false, Ordering::SeqCst);

        tracing::info!("Server '{}' listening on {}", self.name, local_addr);
        self.hooks.on_startup(local_addr);

        Ok(local_addr)
    }

    /// One reactor iteration: the application tick, one multiplexer wait,
    /// then servicing of every ready descriptor.
    pub fn tick(&mut self) -> ServerResult<()> {
        if self.state != ServerState::Running {
            return Err(ServerError::NotRunning);
        }

        self.hooks.main_tick(&mut self.sessions);

        // Readiness is edge-triggered; don't sleep on work that can be done now.
        let backlog: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|session| session.has_read_backlog())
            .map(Session::id)
            .collect();
        let timeout = if !backlog.is_empty() || self.sessions.iter().any(Session::wants_flush) {
            Some(Duration::ZERO)
        } else {
            self.config.poll_timeout
        };

        let Some(poll) = self.poll.as_mut() else {
            return Err(ServerError::NotRunning);
        };
        match poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let ready: Vec<Readiness> = self
            .events
            .iter()
            .map(|event| Readiness {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable(),
            })
            .collect();

        // Record every writable edge before any handler can fail.
        for readiness in ready.iter().filter(|r| r.writable && r.token != LISTENER) {
            if let Some(session) = self.sessions.get_mut(readiness.token.0 as SessionId) {
                session.set_writable();
            }
        }

        let mut result = Ok(());
        let mut serviced = Vec::new();
        for readiness in ready {
            if readiness.token == LISTENER {
                self.accept();
                continue;
            }
            if !readiness.readable {
                continue;
            }

            let id = readiness.token.0 as SessionId;
            if result.is_err() {
                // Picked up on the next tick; this readiness edge won't repeat.
                if let Some(session) = self.sessions.get_mut(id) {
                    session.defer_read();
                }
                continue;
            }
            serviced.push(id);
            if let Err(e) = self.service_read(id) {
                result = Err(e);
            }
        }

        if result.is_ok() {
            for id in backlog.into_iter().filter(|id| !serviced.contains(id)) {
                if let Err(e) = self.service_read(id) {
                    result = Err(e);
                    break;
                }
            }
        }

        self.flush_writable();
        self.reap_closing();

        result
    }

    /// Accept every pending connection
    fn accept(&mut self) {
        loop {
            let (Some(listener), Some(poll)) = (self.listener.as_ref(), self.poll.as_ref()) else {
                return;
            };

            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    let id = self.next_session_id;
                    self.next_session_id += 1;

                    let mut session =
                        Session::new(id, stream, peer_addr, self.config.max_frame_size)
                            .with_read_budget(self.config.read_budget);
                    if let Err(e) = session.register(poll.registry(), Token(id as usize)) {
                        tracing::warn!("Failed to register connection from {}: {}", peer_addr, e);
                        session.close(None);
                        continue;
                    }

                    tracing::info!("Session {} connected from {}", id, peer_addr);
                    self.hooks.on_connect(&mut session);
                    self.sessions.insert(session);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("Accept error: {}", e);
                    return;
                }
            }
        }
    }

    /// Drain a readable session, up to its read budget, and dispatch every
    /// complete frame in order
    fn service_read(&mut self, id: SessionId) -> ServerResult<()> {
        let Some(session) = self.sessions.get_mut(id) else {
            return Ok(());
        };
        if !session.is_established() {
            return Ok(());
        }

        let eof = match session.fill_read_buf() {
            Ok(progress) => progress == ReadProgress::Eof,
            Err(e) => {
                tracing::debug!("Session {} read error: {}", id, e);
                session.request_close();
                return Ok(());
            }
        };

        loop {
            let Some(session) = self.sessions.get_mut(id) else {
                return Ok(());
            };
            if !session.is_established() {
                return Ok(());
            }

            match session.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(e) = self.dispatch(id, frame) {
                        // Frames still buffered are decoded on the next tick.
                        if let Some(session) = self.sessions.get_mut(id) {
                            session.defer_read();
                        }
                        return Err(e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        "Session {} sent a malformed frame, dropping connection: {}",
                        id,
                        e
                    );
                    session.request_close();
                    return Ok(());
                }
            }
        }

        if eof {
            if let Some(session) = self.sessions.get_mut(id) {
                if session.is_mid_frame() {
                    tracing::warn!("Session {} dropped mid-frame", id);
                } else {
                    tracing::debug!("Session {} closed by peer", id);
                }
                session.request_close();
            }
        }

        Ok(())
    }

    /// Route one frame. The session is taken out of the table for the call
    /// so the handler can reach it and its peers at the same time.
    fn dispatch(&mut self, id: SessionId, frame: Frame) -> ServerResult<()> {
        let Some(mut session) = self.sessions.remove(id) else {
            return Ok(());
        };

        tracing::debug!(
            "Session {} read: method {} flags {:#04x} length {}",
            id,
            frame.method,
            frame.flags,
            frame.length
        );

        let routed = self
            .router
            .dispatch(&frame, &mut Dispatch::new(&mut session, &mut self.sessions));
        if routed.is_ok() {
            self.hooks.on_read(&frame, &mut session);
        }
        self.sessions.insert(session);

        routed?;
        Ok(())
    }

    /// Write servicing for every writable session with something to send
    fn flush_writable(&mut self) {
        let ready: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|session| session.wants_flush())
            .map(Session::id)
            .collect();

        for id in ready {
            let Some(session) = self.sessions.get_mut(id) else {
                continue;
            };

            match session.flush() {
                Ok(Some(WriteStatus::Complete(bytes))) => {
                    tracing::debug!("Session {} write: {} bytes", id, bytes.len());
                    self.hooks.on_write(&bytes, session);
                }
                Ok(Some(WriteStatus::Pending { written, remaining })) => {
                    tracing::debug!(
                        "Session {} partial write: {} sent, {} remaining",
                        id,
                        written,
                        remaining
                    );
                }
                Ok(None) => {}
                Err(ConnectionError::Protocol(e)) => {
                    tracing::warn!(
                        "Session {} staged an unencodable message, dropping it: {}",
                        id,
                        e
                    );
                }
                Err(e) => {
                    tracing::debug!("Session {} write error: {}", id, e);
                    session.request_close();
                }
            }
        }
    }

    fn reap_closing(&mut self) {
        let closing: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|session| session.state() == SessionState::Closing)
            .map(Session::id)
            .collect();

        for id in closing {
            self.close_session(id);
        }
    }

    /// Deregister, close, notify, drop - in that order
    fn close_session(&mut self, id: SessionId) {
        let Some(mut session) = self.sessions.remove(id) else {
            return;
        };

        session.close(self.poll.as_ref().map(Poll::registry));

        let stats = session.stats();
        tracing::info!(
            "Session {} disconnected ({}): {} frames in, {} frames out",
            id,
            session.peer_addr(),
            stats.frames_received,
            stats.frames_sent
        );
        self.hooks.on_disconnect(&session);
    }

    /// Close every session, the listener and the multiplexer.
    /// Does nothing unless the server is running.
    pub fn shutdown(&mut self) {
        if self.state != ServerState::Running {
            return;
        }

        for id in self.sessions.ids() {
            self.close_session(id);
        }

        if let (Some(poll), Some(listener)) = (self.poll.as_ref(), self.listener.as_mut()) {
            if let Err(e) = poll.registry().deregister(listener) {
                tracing::debug!("Listener deregister failed: {}", e);
            }
        }
        self.listener = None;
        self.poll = None;
        self.state = ServerState::Stopped;

        tracing::info!("Server '{}' shut down", self.name);
        self.hooks.on_shutdown();
    }

    /// Loop `tick` until stopped. SIGINT/SIGTERM and the shutdown flag end
    /// the loop with an orderly `shutdown`; so does a failing handler, whose
    /// error is then returned.
    pub fn run(&mut self) -> ServerResult<()> {
        if self.state != ServerState::Running {
            return Err(ServerError::NotRunning);
        }

        let mut signals = Vec::new();
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signals.push(signal_hook::flag::register(signal, Arc::clone(&self.shutdown_flag))?);
        }

        let result = loop {
            if self.shutdown_flag.load(Ordering::SeqCst) {
                tracing::info!("Server '{}' stop requested", self.name);
                break Ok(());
            }
            if self.state != ServerState::Running {
                break Ok(());
            }
            if let Err(e) = self.tick() {
                tracing::error!("Server '{}' failed: {}", self.name, e);
                break Err(e);
            }
        };

        self.shutdown();
        for id in signals {
            signal_hook::low_level::unregister(id);
        }

        result
    }

    /// Ask `run` to stop after the current tick
    pub fn stop(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
    }

    /// Shared flag that stops `run` when set, usable from other threads
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ServerState::Running
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Live sessions, for staging messages from outside a handler
    pub fn sessions_mut(&mut self) -> &mut SessionTable {
        &mut self.sessions
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }
}
