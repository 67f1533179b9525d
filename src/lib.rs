//! NanoServe - Small binary-framed TCP reactors
//!
//! A compact framing protocol, a single-threaded readiness-driven server with
//! method routing, a matching client, and a demo multiplayer game.

pub mod config;
pub mod game;
pub mod network;
pub mod protocol;

pub use network::{
    Client, ClientError, ClientHooks, Dispatch, Link, ReactorConfig, Router, RouterError, Server,
    ServerError, ServerHooks, Session, SessionId, SessionTable,
};
pub use protocol::{Frame, OutboundMessage, DEFAULT_PORT, PROTOCOL_VERSION};
