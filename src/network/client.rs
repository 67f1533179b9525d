//! NanoServe Client
//!
//! Drives a single outbound connection with the same readiness loop the
//! server uses for each of its sessions.

use mio::net::TcpStream;
use mio::{Events, Poll, Registry, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::session::{ConnectionError, ReadProgress, Session, SessionId, WriteStatus};
use super::{resolve_host, NoHooks, ReactorConfig};
use crate::protocol::{Frame, OutboundMessage};

const CONNECTION: Token = Token(1);

/// Wait used while disconnected when the configuration asks to block
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Could not resolve {0}")]
    Resolve(String),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connected,
}

/// Application override points for the client. Every hook defaults to a no-op.
pub trait ClientHooks {
    /// A frame arrived from the server
    fn on_read(&mut self, _frame: &Frame, _link: &mut Link) {}

    /// Runs at the start of every tick, connected or not
    fn main_tick(&mut self, _link: &mut Link) {}

    /// The server closed the connection or it failed; the link is already
    /// disconnected. Not called for [`Link::disconnect`].
    fn on_disconnect(&mut self, _link: &mut Link) {}
}

impl ClientHooks for NoHooks {}

/// The client's handle on its connection, passed to every hook
pub struct Link {
    registry: Registry,
    session: Option<Session>,
    connect_timeout: Option<Duration>,
    max_frame_size: usize,
    read_budget: usize,
    connections: SessionId,
    running: bool,
}

impl Link {
    fn new(registry: Registry, config: &ReactorConfig) -> Self {
        Self {
            registry,
            session: None,
            connect_timeout: config.connect_timeout,
            max_frame_size: config.max_frame_size,
            read_budget: config.read_budget,
            connections: 0,
            running: true,
        }
    }

    /// Open the connection. The handshake blocks (bounded by the configured
    /// connect timeout); afterwards the socket is non-blocking and registered.
    pub fn connect(&mut self, host: &str, port: u16) -> ClientResult<SocketAddr> {
        if self.session.is_some() {
            return Err(ClientError::AlreadyConnected);
        }

        let addr = resolve_host(host, port)
            .map_err(|e| ClientError::Resolve(format!("{}:{}: {}", host, port, e)))?;

        tracing::info!("Connecting to {}", addr);
        let stream = match self.connect_timeout {
            Some(timeout) => std::net::TcpStream::connect_timeout(&addr, timeout)?,
            None => std::net::TcpStream::connect(addr)?,
        };
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;

        self.connections += 1;
        let mut session = Session::new(
            self.connections,
            TcpStream::from_std(stream),
            addr,
            self.max_frame_size,
        )
        .with_read_budget(self.read_budget);
        session.register(&self.registry, CONNECTION)?;
        self.session = Some(session);

        tracing::info!("Connected to {}", addr);
        Ok(addr)
    }

    /// Close the connection. Does nothing when already disconnected.
    pub fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close(Some(&self.registry));
            tracing::info!("Disconnected from {}", session.peer_addr());
        }
    }

    /// Stage the next message for the server
    pub fn stage(&mut self, message: OutboundMessage) -> ClientResult<()> {
        let session = self.session.as_mut().ok_or(ClientError::NotConnected)?;
        session.stage(message)?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn state(&self) -> ClientState {
        if self.is_connected() {
            ClientState::Connected
        } else {
            ClientState::Disconnected
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.session.as_ref().map(Session::peer_addr)
    }

    /// The live connection, if any
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Ask `Client::run` to return after the current tick
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

/// NanoServe Client
pub struct Client<H: ClientHooks = NoHooks> {
    config: ReactorConfig,
    hooks: H,
    poll: Poll,
    events: Events,
    link: Link,
    /// Set from signal handlers or other threads to stop `run`
    shutdown_flag: Arc<AtomicBool>,
}

impl<H: ClientHooks> Client<H> {
    /// Create a new, disconnected client
    pub fn new(config: ReactorConfig, hooks: H) -> ClientResult<Self> {
        let poll = Poll::new()?;
        let link = Link::new(poll.registry().try_clone()?, &config);
        let events = Events::with_capacity(config.events_capacity);

        Ok(Self {
            config,
            hooks,
            poll,
            events,
            link,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Connect the link; see [`Link::connect`]
    pub fn connect(&mut self, host: &str, port: u16) -> ClientResult<SocketAddr> {
        self.link.connect(host, port)
    }

    /// One reactor iteration for the single connection
    pub fn tick(&mut self) -> ClientResult<()> {
        self.hooks.main_tick(&mut self.link);

        let timeout = match self.link.session.as_ref() {
            Some(session) if session.wants_flush() || session.has_read_backlog() => {
                Some(Duration::ZERO)
            }
            Some(_) => self.config.poll_timeout,
            None => Some(self.config.poll_timeout.unwrap_or(IDLE_WAIT)),
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let backlog = self
            .link
            .session
            .as_ref()
            .is_some_and(Session::has_read_backlog);
        let (mut readable, mut writable) = (backlog, false);
        for event in self.events.iter().filter(|event| event.token() == CONNECTION) {
            readable |= event.is_readable() || event.is_read_closed() || event.is_error();
            writable |= event.is_writable();
        }

        if writable {
            if let Some(session) = self.link.session.as_mut() {
                session.set_writable();
            }
        }
        if readable {
            self.service_read();
        }
        self.flush();

        let closing = self
            .link
            .session
            .as_ref()
            .is_some_and(|session| !session.is_established());
        if closing {
            self.link.disconnect();
            self.hooks.on_disconnect(&mut self.link);
        }

        Ok(())
    }

    fn service_read(&mut self) {
        let eof = {
            let Some(session) = self.link.session.as_mut() else {
                return;
            };
            match session.fill_read_buf() {
                Ok(progress) => progress == ReadProgress::Eof,
                Err(e) => {
                    tracing::warn!("Read from server failed: {}", e);
                    session.request_close();
                    return;
                }
            }
        };

        loop {
            let Some(session) = self.link.session.as_mut() else {
                return;
            };
            if !session.is_established() {
                return;
            }

            match session.next_frame() {
                Ok(Some(frame)) => {
                    tracing::debug!(
                        "Client read: method {} flags {:#04x} length {}",
                        frame.method,
                        frame.flags,
                        frame.length
                    );
                    self.hooks.on_read(&frame, &mut self.link);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Server sent a malformed frame: {}", e);
                    session.request_close();
                    return;
                }
            }
        }

        if eof {
            if let Some(session) = self.link.session.as_mut() {
                if session.is_mid_frame() {
                    tracing::warn!("Server closed the connection mid-frame");
                } else {
                    tracing::info!("Server closed the connection");
                }
                session.request_close();
            }
        }
    }

    fn flush(&mut self) {
        let Some(session) = self.link.session.as_mut() else {
            return;
        };
        if !session.wants_flush() {
            return;
        }

        match session.flush() {
            Ok(Some(WriteStatus::Complete(bytes))) => {
                tracing::debug!("Client write: {} bytes", bytes.len());
            }
            Ok(Some(WriteStatus::Pending { written, remaining })) => {
                tracing::debug!("Client partial write: {} sent, {} remaining", written, remaining);
            }
            Ok(None) => {}
            Err(ConnectionError::Protocol(e)) => {
                tracing::warn!("Dropping unencodable message: {}", e);
            }
            Err(e) => {
                tracing::warn!("Write to server failed: {}", e);
                session.request_close();
            }
        }
    }

    /// Loop `tick` until a hook calls [`Link::stop`], the shutdown flag is
    /// set, or SIGINT/SIGTERM arrives. The link is disconnected on return.
    pub fn run(&mut self) -> ClientResult<()> {
        let mut signals = Vec::new();
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signals.push(signal_hook::flag::register(signal, Arc::clone(&self.shutdown_flag))?);
        }

        let result = loop {
            if self.shutdown_flag.load(Ordering::SeqCst) {
                tracing::info!("Client stop requested");
                break Ok(());
            }
            if !self.link.is_running() {
                break Ok(());
            }
            if let Err(e) = self.tick() {
                tracing::error!("Client failed: {}", e);
                break Err(e);
            }
        };

        self.link.disconnect();
        for id in signals {
            signal_hook::low_level::unregister(id);
        }

        result
    }

    /// Shared flag that stops `run` when set, usable from other threads
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    pub fn state(&self) -> ClientState {
        self.link.state()
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, encode};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    #[derive(Default)]
    struct Recording {
        frames: Vec<Frame>,
        ticks: u32,
        disconnects: u32,
    }

    impl ClientHooks for Recording {
        fn on_read(&mut self, frame: &Frame, link: &mut Link) {
            self.frames.push(frame.clone());
            if frame.method == 2 {
                link.stage(OutboundMessage::new(0x00, 3, frame.payload.clone()))
                    .unwrap();
            }
        }

        fn main_tick(&mut self, _link: &mut Link) {
            self.ticks += 1;
        }

        fn on_disconnect(&mut self, _link: &mut Link) {
            self.disconnects += 1;
        }
    }

    fn test_config() -> ReactorConfig {
        ReactorConfig::new().with_poll_timeout(Some(Duration::from_millis(5)))
    }

    fn connected() -> (Client<Recording>, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut client = Client::new(test_config(), Recording::default()).unwrap();
        client.connect("127.0.0.1", port).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        (client, server_side)
    }

    fn tick_until<H: ClientHooks>(
        client: &mut Client<H>,
        mut done: impl FnMut(&Client<H>) -> bool,
    ) {
        for _ in 0..400 {
            if done(client) {
                return;
            }
            client.tick().unwrap();
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_read_and_reply() {
        let (mut client, mut server_side) = connected();
        assert_eq!(client.state(), ClientState::Connected);

        server_side
            .write_all(&encode(0x01, 5, 2, b"hello").unwrap())
            .unwrap();
        tick_until(&mut client, |c| !c.hooks().frames.is_empty());

        let frame = &client.hooks().frames[0];
        assert_eq!(frame.method, 2);
        assert!(frame.is_wide_length());
        assert_eq!(&frame.payload[..], b"hello");

        // The reply staged from on_read goes out on a later tick.
        for _ in 0..3 {
            client.tick().unwrap();
        }
        let reply = decode(&mut server_side).unwrap().unwrap();
        assert_eq!(reply.method, 3);
        assert_eq!(&reply.payload[..], b"hello");
    }

    #[test]
    fn test_burst_larger_than_read_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = test_config().with_read_budget(16);
        let mut client = Client::new(config, Recording::default()).unwrap();
        client.connect("127.0.0.1", port).unwrap();
        let (mut server_side, _) = listener.accept().unwrap();

        let mut burst = Vec::new();
        for i in 0..10u8 {
            burst.extend_from_slice(&encode(0x00, 4, 7, &[i; 4][..]).unwrap());
        }
        server_side.write_all(&burst).unwrap();

        tick_until(&mut client, |c| c.hooks().frames.len() == 10);
        let order: Vec<u8> = client.hooks().frames.iter().map(|f| f.payload[0]).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[test]
    fn test_main_tick_staging_is_sent() {
        let (mut client, mut server_side) = connected();
        client
            .link_mut()
            .stage(OutboundMessage::new(0x00, 0, &b"zafflins"[..]))
            .unwrap();

        for _ in 0..3 {
            client.tick().unwrap();
        }
        let frame = decode(&mut server_side).unwrap().unwrap();
        assert_eq!(frame.method, 0);
        assert_eq!(&frame.payload[..], b"zafflins");
        assert!(client.hooks().ticks >= 3);
    }

    #[test]
    fn test_server_close_disconnects_once() {
        let (mut client, server_side) = connected();
        drop(server_side);

        tick_until(&mut client, |c| c.state() == ClientState::Disconnected);
        assert_eq!(client.hooks().disconnects, 1);

        client.tick().unwrap();
        assert_eq!(client.hooks().disconnects, 1);
        assert!(matches!(
            client.link_mut().stage(OutboundMessage::new(0, 1, &b""[..])),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn test_connect_twice_rejected() {
        let (mut client, _server_side) = connected();
        let port = client.link().peer_addr().unwrap().port();
        assert!(matches!(
            client.connect("127.0.0.1", port),
            Err(ClientError::AlreadyConnected)
        ));

        client.link_mut().disconnect();
        client.link_mut().disconnect();
        assert!(!client.link().is_connected());
        assert_eq!(client.hooks().disconnects, 0);
    }

    #[test]
    fn test_connect_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut client = Client::new(test_config(), NoHooks).unwrap();
        assert!(matches!(client.connect("127.0.0.1", port), Err(ClientError::Io(_))));
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[test]
    fn test_run_returns_when_stopped() {
        struct StopAfter(u32);
        impl ClientHooks for StopAfter {
            fn main_tick(&mut self, link: &mut Link) {
                self.0 -= 1;
                if self.0 == 0 {
                    link.stop();
                }
            }
        }

        let mut client = Client::new(test_config(), StopAfter(3)).unwrap();
        client.run().unwrap();
        assert_eq!(client.hooks().0, 0);
    }
}
