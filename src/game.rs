//! Demo multiplayer game built on the reactors
//!
//! Clients join with a username (method 0) and move with a JSON delta
//! (method 1). After every change the server broadcasts the full player map
//! to every live session, wide-length flagged, on method 1.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::ops::RangeInclusive;
use std::rc::Rc;

use crate::network::{
    ClientHooks, Dispatch, HandlerResult, Link, Router, RouterError, ServerHooks, Session,
    SessionId, SessionTable,
};
use crate::protocol::{flags, Frame, OutboundMessage};

/// Client to server: join, payload is the username
pub const METHOD_JOIN: u32 = 0;
/// Client to server: move, payload is a JSON [`Move`]
pub const METHOD_MOVE: u32 = 1;
/// Server to client: JSON [`PlayerMap`]
pub const METHOD_STATE: u32 = 1;

/// Range of each coordinate of a freshly spawned player
pub const SPAWN_RANGE: RangeInclusive<i32> = 50..=400;

/// Distance covered by one scripted move along each axis
pub const MOVE_STEP: i32 = 5;

/// Positions of every joined player, keyed by session id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerMap {
    pub players: BTreeMap<SessionId, [i32; 2]>,
}

/// A relative move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub dx: i32,
    pub dy: i32,
}

/// Server-side game state
pub struct World {
    players: PlayerMap,
    names: BTreeMap<SessionId, String>,
    rng: StdRng,
    /// Set when a change has not been broadcast yet
    dirty: bool,
}

pub type SharedWorld = Rc<RefCell<World>>;

impl World {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// A world with reproducible spawn positions
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            players: PlayerMap::default(),
            names: BTreeMap::new(),
            rng,
            dirty: false,
        }
    }

    pub fn shared(self) -> SharedWorld {
        Rc::new(RefCell::new(self))
    }

    /// Place a player at a random spawn position. Joining again respawns.
    pub fn join(&mut self, id: SessionId, name: impl Into<String>) -> [i32; 2] {
        let position = [
            self.rng.gen_range(SPAWN_RANGE),
            self.rng.gen_range(SPAWN_RANGE),
        ];
        self.players.players.insert(id, position);
        self.names.insert(id, name.into());
        self.dirty = true;
        position
    }

    /// Move a joined player. Returns false for unknown players.
    /// Coordinates saturate at the `i32` bounds.
    pub fn apply_move(&mut self, id: SessionId, step: Move) -> bool {
        let Some(position) = self.players.players.get_mut(&id) else {
            return false;
        };
        position[0] = position[0].saturating_add(step.dx);
        position[1] = position[1].saturating_add(step.dy);
        self.dirty = true;
        true
    }

    /// Remove a player. Returns false if it never joined.
    pub fn leave(&mut self, id: SessionId) -> bool {
        self.names.remove(&id);
        let removed = self.players.players.remove(&id).is_some();
        self.dirty |= removed;
        removed
    }

    pub fn players(&self) -> &PlayerMap {
        &self.players
    }

    pub fn name(&self, id: SessionId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn position(&self, id: SessionId) -> Option<[i32; 2]> {
        self.players.players.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.players.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.players.is_empty()
    }

    /// The player map as a broadcast-ready message. Clears the dirty flag.
    pub fn state_message(&mut self) -> serde_json::Result<OutboundMessage> {
        let payload = serde_json::to_vec(&self.players)?;
        self.dirty = false;
        Ok(OutboundMessage::new(flags::WIDE_LENGTH, METHOD_STATE, payload))
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

/// Register the join and move handlers, both sharing `world`
pub fn register_routes(router: &mut Router, world: &SharedWorld) -> Result<(), RouterError> {
    router.register(METHOD_JOIN, on_join, Rc::clone(world))?;
    router.register(METHOD_MOVE, on_move, Rc::clone(world))?;
    Ok(())
}

fn on_join(frame: &Frame, dispatch: &mut Dispatch<'_>, world: &mut SharedWorld) -> HandlerResult {
    let id = dispatch.session().id();
    let name = String::from_utf8_lossy(&frame.payload).into_owned();

    let mut world = world.borrow_mut();
    let position = world.join(id, name.as_str());
    tracing::info!(
        "Player {} ({}) joined at {:?}, {} players",
        id,
        name,
        position,
        world.len()
    );

    dispatch.broadcast(world.state_message()?);
    Ok(())
}

fn on_move(frame: &Frame, dispatch: &mut Dispatch<'_>, world: &mut SharedWorld) -> HandlerResult {
    let id = dispatch.session().id();
    let step: Move = match serde_json::from_slice(&frame.payload) {
        Ok(step) => step,
        Err(e) => {
            tracing::warn!("Player {} sent a malformed move: {}", id, e);
            return Ok(());
        }
    };

    let mut world = world.borrow_mut();
    if !world.apply_move(id, step) {
        tracing::debug!("Move from session {} before joining, ignored", id);
        return Ok(());
    }

    dispatch.broadcast(world.state_message()?);
    Ok(())
}

/// Server hooks for the game: players leave with their session, and the
/// remaining sessions are told on the next tick.
pub struct GameServerHooks {
    world: SharedWorld,
}

impl GameServerHooks {
    pub fn new(world: &SharedWorld) -> Self {
        Self {
            world: Rc::clone(world),
        }
    }

    pub fn world(&self) -> &SharedWorld {
        &self.world
    }
}

impl ServerHooks for GameServerHooks {
    fn on_connect(&mut self, session: &mut Session) {
        tracing::debug!("Session {} may now join", session.id());
    }

    fn on_disconnect(&mut self, session: &Session) {
        let mut world = self.world.borrow_mut();
        if world.leave(session.id()) {
            tracing::info!("Player {} left, {} players", session.id(), world.len());
        }
    }

    fn main_tick(&mut self, sessions: &mut SessionTable) {
        let mut world = self.world.borrow_mut();
        if !world.dirty {
            return;
        }
        match world.state_message() {
            Ok(message) => {
                sessions.broadcast(&message);
            }
            Err(e) => tracing::warn!("Could not serialize player map: {}", e),
        }
    }
}

/// Headless game client: joins, plays a scripted list of moves, then lingers
/// for a few ticks to receive the final state before stopping.
pub struct GameClient {
    username: String,
    moves: VecDeque<Move>,
    joined: bool,
    linger_ticks: u32,
    players: PlayerMap,
    updates: u64,
}

impl GameClient {
    pub fn new(username: impl Into<String>, moves: impl IntoIterator<Item = Move>) -> Self {
        Self {
            username: username.into(),
            moves: moves.into_iter().collect(),
            joined: false,
            linger_ticks: 20,
            players: PlayerMap::default(),
            updates: 0,
        }
    }

    /// `count` moves of [`MOVE_STEP`] in random directions
    pub fn with_random_moves<R: Rng>(
        username: impl Into<String>,
        count: usize,
        rng: &mut R,
    ) -> Self {
        let steps = [-MOVE_STEP, 0, MOVE_STEP];
        let mut moves = Vec::with_capacity(count);
        while moves.len() < count {
            let dx = steps[rng.gen_range(0..steps.len())];
            let dy = steps[rng.gen_range(0..steps.len())];
            if dx != 0 || dy != 0 {
                moves.push(Move { dx, dy });
            }
        }
        Self::new(username, moves)
    }

    /// Append a move to the script
    pub fn queue_move(&mut self, step: Move) {
        self.moves.push_back(step);
    }

    pub fn with_linger_ticks(mut self, linger_ticks: u32) -> Self {
        self.linger_ticks = linger_ticks;
        self
    }

    /// The latest player map received from the server
    pub fn players(&self) -> &PlayerMap {
        &self.players
    }

    /// State broadcasts received so far
    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn has_joined(&self) -> bool {
        self.joined
    }

    pub fn remaining_moves(&self) -> usize {
        self.moves.len()
    }

    fn stage(link: &mut Link, method: u32, payload: Vec<u8>) -> bool {
        match link.stage(OutboundMessage::new(0x00, method, payload)) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Could not stage method {}: {}", method, e);
                false
            }
        }
    }
}

impl ClientHooks for GameClient {
    fn on_read(&mut self, frame: &Frame, _link: &mut Link) {
        if frame.method != METHOD_STATE {
            tracing::debug!("Ignoring method {} from server", frame.method);
            return;
        }

        match serde_json::from_slice::<PlayerMap>(&frame.payload) {
            Ok(players) => {
                self.players = players;
                self.updates += 1;
            }
            Err(e) => tracing::warn!("Malformed player map: {}", e),
        }
    }

    fn main_tick(&mut self, link: &mut Link) {
        // One message in flight at a time; staging again would replace it.
        let idle = link
            .session()
            .is_some_and(|session| session.staged().is_none() && !session.has_pending_write());
        if !idle {
            return;
        }

        if !self.joined {
            let name = self.username.clone().into_bytes();
            self.joined = Self::stage(link, METHOD_JOIN, name);
            if self.joined {
                tracing::info!("Joining as {}", self.username);
            }
            return;
        }

        if let Some(step) = self.moves.front().copied() {
            match serde_json::to_vec(&step) {
                Ok(payload) => {
                    if Self::stage(link, METHOD_MOVE, payload) {
                        self.moves.pop_front();
                    }
                }
                Err(e) => {
                    tracing::warn!("Could not serialize move: {}", e);
                    self.moves.pop_front();
                }
            }
            return;
        }

        if self.linger_ticks == 0 {
            if link.is_running() {
                tracing::info!("Moves done, {} players in view", self.players.players.len());
                link.stop();
            }
        } else {
            self.linger_ticks -= 1;
        }
    }

    fn on_disconnect(&mut self, link: &mut Link) {
        tracing::info!("Server went away");
        self.players = PlayerMap::default();
        link.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_support::loopback_session;
    use crate::network::NoHooks;
    use crate::protocol::PROTOCOL_VERSION;
    use bytes::Bytes;

    fn frame(method: u32, payload: &[u8]) -> Frame {
        Frame {
            version: PROTOCOL_VERSION,
            flags: 0,
            method,
            length: payload.len() as u32,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_join_spawns_in_range() {
        let mut world = World::with_seed(7);
        for id in 1..=50 {
            let [x, y] = world.join(id, "p");
            assert!(SPAWN_RANGE.contains(&x));
            assert!(SPAWN_RANGE.contains(&y));
        }
        assert_eq!(world.len(), 50);
    }

    #[test]
    fn test_move_and_leave() {
        let mut world = World::with_seed(1);
        let [x, y] = world.join(3, "zafflins");
        assert_eq!(world.name(3), Some("zafflins"));

        assert!(world.apply_move(3, Move { dx: 5, dy: -5 }));
        assert_eq!(world.position(3), Some([x + 5, y - 5]));
        assert!(!world.apply_move(4, Move { dx: 1, dy: 1 }));

        assert!(world.leave(3));
        assert!(!world.leave(3));
        assert!(world.is_empty());
    }

    #[test]
    fn test_extreme_move_saturates() {
        let mut world = World::with_seed(8);
        world.join(1, "far");

        assert!(world.apply_move(1, Move { dx: i32::MAX, dy: 0 }));
        assert!(world.apply_move(1, Move { dx: i32::MAX, dy: i32::MIN }));
        assert_eq!(world.position(1), Some([i32::MAX, i32::MIN]));
    }

    #[test]
    fn test_extreme_move_through_router() {
        let world = World::with_seed(9).shared();
        let mut router = Router::new();
        register_routes(&mut router, &world).unwrap();

        let (mut session, _peer) = loopback_session(1);
        let mut peers = SessionTable::new();
        router
            .dispatch(
                &frame(METHOD_JOIN, b"far"),
                &mut Dispatch::new(&mut session, &mut peers),
            )
            .unwrap();
        router
            .dispatch(
                &frame(METHOD_MOVE, br#"{"dx":2147483647,"dy":0}"#),
                &mut Dispatch::new(&mut session, &mut peers),
            )
            .unwrap();

        assert_eq!(world.borrow().position(1).map(|[x, _]| x), Some(i32::MAX));
    }

    #[test]
    fn test_state_message_format() {
        let mut world = World::with_seed(2);
        let [x, y] = world.join(1, "a");
        let message = world.state_message().unwrap();

        assert_eq!(message.flags, 0x01);
        assert_eq!(message.method, 1);
        let json: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(json, serde_json::json!({ "players": { "1": [x, y] } }));
        assert!(!world.dirty);
    }

    #[test]
    fn test_join_and_move_handlers_broadcast() {
        let world = World::with_seed(3).shared();
        let mut router = Router::new();
        register_routes(&mut router, &world).unwrap();

        let (mut session, _p1) = loopback_session(1);
        let (other, _p2) = loopback_session(2);
        let mut peers = SessionTable::new();
        peers.insert(other);

        router
            .dispatch(
                &frame(METHOD_JOIN, b"zafflins"),
                &mut Dispatch::new(&mut session, &mut peers),
            )
            .unwrap();
        let start = world.borrow().position(1).unwrap();
        assert!(peers.get(2).unwrap().staged().is_some());

        router
            .dispatch(
                &frame(METHOD_MOVE, br#"{"dx":5,"dy":0}"#),
                &mut Dispatch::new(&mut session, &mut peers),
            )
            .unwrap();
        assert_eq!(world.borrow().position(1), Some([start[0] + 5, start[1]]));

        let staged = session.staged().unwrap();
        let state: PlayerMap = serde_json::from_slice(&staged.payload).unwrap();
        assert_eq!(&state, world.borrow().players());
    }

    #[test]
    fn test_malformed_move_is_ignored() {
        let world = World::with_seed(4).shared();
        let mut router = Router::new();
        register_routes(&mut router, &world).unwrap();

        let (mut session, _p1) = loopback_session(1);
        let mut peers = SessionTable::new();
        let routed = router
            .dispatch(
                &frame(METHOD_MOVE, b"not json"),
                &mut Dispatch::new(&mut session, &mut peers),
            )
            .unwrap();

        assert!(routed);
        assert!(session.staged().is_none());
    }

    #[test]
    fn test_disconnect_broadcasts_on_next_tick() {
        let world = World::with_seed(5).shared();
        world.borrow_mut().join(1, "a");
        world.borrow_mut().join(2, "b");
        world.borrow_mut().state_message().unwrap();

        let mut hooks = GameServerHooks::new(&world);
        let (mut leaving, _p1) = loopback_session(1);
        leaving.close(None);
        hooks.on_disconnect(&leaving);

        let (remaining, _p2) = loopback_session(2);
        let mut sessions = SessionTable::new();
        sessions.insert(remaining);
        hooks.main_tick(&mut sessions);

        let staged = sessions.get(2).unwrap().staged().unwrap();
        let state: PlayerMap = serde_json::from_slice(&staged.payload).unwrap();
        assert_eq!(state.players.keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_random_moves() {
        let mut rng = StdRng::seed_from_u64(9);
        let client = GameClient::with_random_moves("x", 12, &mut rng);
        assert_eq!(client.remaining_moves(), 12);
        assert!(client
            .moves
            .iter()
            .all(|m| {
                (m.dx != 0 || m.dy != 0) && m.dx.abs() <= MOVE_STEP && m.dy.abs() <= MOVE_STEP
            }));
    }

    #[test]
    fn test_client_tracks_player_map() {
        let mut client = GameClient::new("x", []);
        let world = {
            let mut world = World::with_seed(6);
            world.join(4, "x");
            world
        };
        let payload = serde_json::to_vec(world.players()).unwrap();
        let mut state = frame(METHOD_STATE, &payload);
        state.flags = flags::WIDE_LENGTH;

        let mut reactor =
            crate::network::Client::new(crate::network::ReactorConfig::new(), NoHooks).unwrap();
        client.on_read(&state, reactor.link_mut());

        assert_eq!(client.players(), world.players());
        assert_eq!(client.updates(), 1);
    }
}
