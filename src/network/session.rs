//! Session handling for NanoServe
//!
//! A session is the per-connection record owned by a reactor:
//! - Socket, peer address and identifier
//! - One staged outbound message and any partially flushed frame
//! - Read buffer and frame decoder
//! - Lifecycle state and statistics

use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use thiserror::Error;

use crate::protocol::{CodecError, Frame, FrameDecoder, OutboundMessage};

/// Size of each read from the socket
const READ_CHUNK: usize = 4096;

/// Default cap on bytes drained from the socket per servicing step
pub const DEFAULT_READ_BUDGET: usize = 64 * READ_CHUNK;

/// Session identifier, unique for the lifetime of a reactor
pub type SessionId = u64;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("A previous frame is still being flushed")]
    FlushPending,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, not yet registered with the multiplexer
    Connecting,
    /// Registered for read and write readiness
    Established,
    /// Teardown requested, takes effect after the current servicing step
    Closing,
    /// Deregistered and closed
    Closed,
}

/// Session statistics
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Frames fully flushed to the peer
    pub frames_sent: u64,
    /// Frames decoded from the peer
    pub frames_received: u64,
    /// Bytes written to the socket
    pub bytes_sent: u64,
    /// Bytes read from the socket
    pub bytes_received: u64,
}

/// Outcome of a write attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStatus {
    /// Every byte reached the socket; holds the bytes that were sent
    Complete(Bytes),
    /// The socket would block; the rest is retried on the next writable event
    Pending { written: usize, remaining: usize },
}

/// How a read servicing step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadProgress {
    /// The socket has nothing more right now
    Drained,
    /// The read budget ran out with data possibly left in the socket
    Limited,
    /// The peer closed its side
    Eof,
}

struct PendingWrite {
    frame: Bytes,
    written: usize,
}

/// Server-side per-connection state
pub struct Session {
    id: SessionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: SessionState,
    outbound: Option<OutboundMessage>,
    pending: Option<PendingWrite>,
    read_buf: BytesMut,
    decoder: FrameDecoder,
    read_budget: usize,
    /// Unread socket data left behind by the read budget
    read_backlog: bool,
    writable: bool,
    stats: SessionStats,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        stream: TcpStream,
        peer_addr: SocketAddr,
        max_frame_size: usize,
    ) -> Self {
        Self {
            id,
            stream,
            peer_addr,
            state: SessionState::Connecting,
            outbound: None,
            pending: None,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
            read_budget: DEFAULT_READ_BUDGET,
            read_backlog: false,
            writable: false,
            stats: SessionStats::default(),
        }
    }

    /// Cap the bytes drained per servicing step
    pub(crate) fn with_read_budget(mut self, read_budget: usize) -> Self {
        self.read_budget = read_budget.max(1);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Stage the next message to send.
    ///
    /// A message staged earlier but not yet sent is replaced. Staging while a
    /// frame is partially on the wire fails with `FlushPending`.
    pub fn stage(&mut self, message: OutboundMessage) -> ConnectionResult<()> {
        match self.state {
            SessionState::Connecting | SessionState::Established => {}
            SessionState::Closing | SessionState::Closed => return Err(ConnectionError::Closed),
        }
        if self.pending.is_some() {
            return Err(ConnectionError::FlushPending);
        }

        if let Some(previous) = self.outbound.replace(message) {
            tracing::trace!(
                "Session {} replaced unsent message (method {})",
                self.id,
                previous.method
            );
        }
        Ok(())
    }

    /// The message waiting for the next writable event, if any
    pub fn staged(&self) -> Option<&OutboundMessage> {
        self.outbound.as_ref()
    }

    /// Whether an encoded frame is partially flushed
    pub fn has_pending_write(&self) -> bool {
        self.pending.is_some()
    }

    /// Ask the owning reactor to close this session once the current
    /// servicing step is done.
    pub fn request_close(&mut self) {
        if matches!(self.state, SessionState::Connecting | SessionState::Established) {
            self.state = SessionState::Closing;
        }
    }

    /// Send raw bytes, looping until all of them are written or the socket
    /// would block. Unsent bytes stay queued for the next writable event.
    pub fn write(&mut self, bytes: Bytes) -> ConnectionResult<WriteStatus> {
        if self.pending.is_some() {
            return Err(ConnectionError::FlushPending);
        }
        self.pending = Some(PendingWrite {
            frame: bytes,
            written: 0,
        });
        self.resume_write()
    }

    fn resume_write(&mut self) -> ConnectionResult<WriteStatus> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(WriteStatus::Complete(Bytes::new()));
        };

        while pending.written < pending.frame.len() {
            match self.stream.write(&pending.frame[pending.written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    pending.written += n;
                    self.stats.bytes_sent += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.writable = false;
                    return Ok(WriteStatus::Pending {
                        written: pending.written,
                        remaining: pending.frame.len() - pending.written,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let frame = match self.pending.take() {
            Some(done) => done.frame,
            None => Bytes::new(),
        };
        self.stats.frames_sent += 1;
        Ok(WriteStatus::Complete(frame))
    }

    /// Write servicing: resume a partial frame, or encode and send the
    /// staged message. Returns `None` when there was nothing to send.
    ///
    /// An unencodable staged message is dropped and reported as
    /// `ConnectionError::Protocol`; the session itself stays usable.
    pub(crate) fn flush(&mut self) -> ConnectionResult<Option<WriteStatus>> {
        if self.pending.is_none() {
            let Some(message) = self.outbound.take() else {
                return Ok(None);
            };
            self.pending = Some(PendingWrite {
                frame: message.encode()?,
                written: 0,
            });
        }
        self.resume_write().map(Some)
    }

    /// Whether the socket is known writable and something is waiting to go out
    pub(crate) fn wants_flush(&self) -> bool {
        self.state == SessionState::Established
            && self.writable
            && (self.outbound.is_some() || self.pending.is_some())
    }

    pub(crate) fn set_writable(&mut self) {
        self.writable = true;
    }

    /// Drain the socket into the read buffer, stopping after the read budget.
    ///
    /// Readiness is edge-triggered, so a `Limited` session must be serviced
    /// again without waiting for another event; `has_read_backlog` tracks that.
    pub(crate) fn fill_read_buf(&mut self) -> ConnectionResult<ReadProgress> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut budget = self.read_budget;
        self.read_backlog = false;

        while budget > 0 {
            let want = budget.min(READ_CHUNK);
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => return Ok(ReadProgress::Eof),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    self.stats.bytes_received += n as u64;
                    budget -= n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadProgress::Drained),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.read_backlog = true;
        Ok(ReadProgress::Limited)
    }

    /// Service this session again on the next tick even without a readiness event
    pub(crate) fn defer_read(&mut self) {
        self.read_backlog = true;
    }

    /// Whether the session must be read again without waiting for an event
    pub(crate) fn has_read_backlog(&self) -> bool {
        self.read_backlog && self.state == SessionState::Established
    }

    /// Pull the next complete frame out of the read buffer
    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        let frame = self.decoder.decode(&mut self.read_buf)?;
        if frame.is_some() {
            self.stats.frames_received += 1;
        }
        Ok(frame)
    }

    /// Whether buffered bytes form the start of an unfinished frame
    pub(crate) fn is_mid_frame(&self) -> bool {
        self.decoder.is_mid_frame(&self.read_buf)
    }

    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(
            &mut self.stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.state = SessionState::Established;
        Ok(())
    }

    /// Deregister and close the socket. Safe to call more than once.
    pub(crate) fn close(&mut self, registry: Option<&Registry>) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(registry) = registry {
            if let Err(e) = registry.deregister(&mut self.stream) {
                tracing::debug!("Session {} deregister failed: {}", self.id, e);
            }
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::debug!("Session {} shutdown failed: {}", self.id, e);
            }
        }
        self.outbound = None;
        self.pending = None;
        self.state = SessionState::Closed;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}

/// The reactor-owned set of live sessions, keyed by id.
///
/// Handlers can reach every session through it but cannot add or remove
/// entries; that bookkeeping belongs to the reactor.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: BTreeMap<SessionId, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Live session ids in ascending order
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// Stage `message` on every session in the table.
    /// Returns how many sessions accepted it.
    pub fn broadcast(&mut self, message: &OutboundMessage) -> usize {
        let mut staged = 0;
        for session in self.sessions.values_mut() {
            match session.stage(message.clone()) {
                Ok(()) => staged += 1,
                Err(e) => tracing::debug!("Broadcast skipped session {}: {}", session.id, e),
            }
        }
        staged
    }

    pub(crate) fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    pub(crate) fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }
}
