//! Method router
//!
//! Maps method identifiers to handlers. Each handler owns a context value of
//! any type, handed back to it on every call.

use std::collections::HashMap;
use thiserror::Error;

use super::session::{ConnectionResult, Session, SessionTable};
use crate::protocol::{Frame, OutboundMessage};

/// Result type for handler functions
pub type HandlerResult = anyhow::Result<()>;

type BoxedHandler = Box<dyn FnMut(&Frame, &mut Dispatch<'_>) -> HandlerResult>;

/// Router errors
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Method {0} is already registered")]
    DuplicateRoute(u32),

    #[error("Handler for method {method} failed: {source}")]
    Handler {
        method: u32,
        #[source]
        source: anyhow::Error,
    },
}

/// What a handler sees of the reactor during one dispatch: the session the
/// frame arrived on, and every other live session.
pub struct Dispatch<'a> {
    session: &'a mut Session,
    peers: &'a mut SessionTable,
}

impl<'a> Dispatch<'a> {
    pub(crate) fn new(session: &'a mut Session, peers: &'a mut SessionTable) -> Self {
        Self { session, peers }
    }

    /// The session the frame arrived on
    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        self.session
    }

    /// Every other live session
    pub fn peers(&self) -> &SessionTable {
        self.peers
    }

    pub fn peers_mut(&mut self) -> &mut SessionTable {
        self.peers
    }

    /// Stage a message back to the sender
    pub fn reply(&mut self, message: OutboundMessage) -> ConnectionResult<()> {
        self.session.stage(message)
    }

    /// Stage a message on every live session, the sender included.
    /// Returns how many sessions accepted it.
    pub fn broadcast(&mut self, message: OutboundMessage) -> usize {
        let mut staged = self.peers.broadcast(&message);
        match self.session.stage(message) {
            Ok(()) => staged += 1,
            Err(e) => tracing::debug!("Broadcast skipped session {}: {}", self.session.id(), e),
        }
        staged
    }
}

struct Route {
    method: u32,
    handler: BoxedHandler,
}

/// Dispatches decoded frames to handlers registered per method
#[derive(Default)]
pub struct Router {
    /// Routes in registration order
    routes: Vec<Route>,
    /// Method to position in `routes`
    index: HashMap<u32, usize>,
    unrouted: u64,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`, handing it `context` on every call.
    ///
    /// A method can only be registered once; later registrations are
    /// rejected and the first handler stays active.
    pub fn register<C, F>(
        &mut self,
        method: u32,
        mut handler: F,
        mut context: C,
    ) -> Result<(), RouterError>
    where
        C: 'static,
        F: FnMut(&Frame, &mut Dispatch<'_>, &mut C) -> HandlerResult + 'static,
    {
        if self.index.contains_key(&method) {
            tracing::warn!("Route for method {} already registered, keeping the first", method);
            return Err(RouterError::DuplicateRoute(method));
        }

        let boxed: BoxedHandler =
            Box::new(move |frame, dispatch| handler(frame, dispatch, &mut context));
        self.index.insert(method, self.routes.len());
        self.routes.push(Route {
            method,
            handler: boxed,
        });
        Ok(())
    }

    /// Run the handler registered for `frame.method`.
    ///
    /// Returns `Ok(false)` when no route matches. Handler errors are passed
    /// up untouched.
    pub fn dispatch(
        &mut self,
        frame: &Frame,
        dispatch: &mut Dispatch<'_>,
    ) -> Result<bool, RouterError> {
        let Some(&slot) = self.index.get(&frame.method) else {
            self.unrouted += 1;
            tracing::debug!(
                "Route not registered: method {} from session {}",
                frame.method,
                dispatch.session().id()
            );
            return Ok(false);
        };

        let route = &mut self.routes[slot];
        (route.handler)(frame, dispatch).map_err(|source| RouterError::Handler {
            method: route.method,
            source,
        })?;
        Ok(true)
    }

    pub fn contains(&self, method: u32) -> bool {
        self.index.contains_key(&method)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered methods in registration order
    pub fn methods(&self) -> impl Iterator<Item = u32> + '_ {
        self.routes.iter().map(|route| route.method)
    }

    /// Frames seen so far that matched no route
    pub fn unrouted(&self) -> u64 {
        self.unrouted
    }
}
