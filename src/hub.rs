//! The session hub: per-process fan-out of push frames.
//!
//! A single [`SessionHub`] actor tracks every local push-channel
//! subscriber and what it is interested in: one game session, a pending
//! matchmaking connection, or the lobby. Publishers (the event bus) hand
//! it fully rendered frames; the hub only routes.
//!
//! Delivery uses `try_send`, so a subscriber whose mailbox has filled up —
//! a peer that stopped reading — is dropped and reaped instead of stalling
//! the rest of the room. Frames for one subscriber arrive in publication
//! order; no ordering is promised across subscribers.
//!
//! The hub holds no history. A reconnecting client refetches the game
//! over the read API and then follows incremental frames.

use actix::prelude::*;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// What a subscriber wants to receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest {
    /// All frames of one game session.
    Session(Uuid),
    /// The `match_found` frame for one matchmaking connection id.
    Matchmaking(String),
    /// Lobby updates.
    Lobby,
}

/// A rendered frame on its way to one subscriber's socket.
#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct PushFrame(pub String);

/// Registers a subscriber with the hub.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect {
    pub subscriber_id: Uuid,
    pub interest: Interest,
    pub addr: Recipient<PushFrame>,
}

/// Unregisters a subscriber.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub subscriber_id: Uuid,
}

/// Fans a frame out to every subscriber of a session.
#[derive(Message)]
#[rtype(result = "()")]
pub struct BroadcastSession {
    pub session_id: Uuid,
    pub frame: String,
}

/// Delivers a frame to the pending matchmaking channel of one connection.
#[derive(Message)]
#[rtype(result = "()")]
pub struct NotifyMatchFound {
    pub connection_id: String,
    pub frame: String,
}

/// Fans a frame out to every lobby subscriber.
#[derive(Message)]
#[rtype(result = "()")]
pub struct BroadcastLobby {
    pub frame: String,
}

/// The hub actor. Subscribers reference rooms by id and rooms reference
/// subscribers by id, so there are no ownership cycles to break.
#[derive(Default)]
pub struct SessionHub {
    subscribers: HashMap<Uuid, Recipient<PushFrame>>,
    interests: HashMap<Uuid, Interest>,
    rooms: HashMap<Uuid, HashSet<Uuid>>,
    match_waiters: HashMap<String, Uuid>,
    lobby: HashSet<Uuid>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn remove(&mut self, subscriber_id: &Uuid) {
        self.subscribers.remove(subscriber_id);
        match self.interests.remove(subscriber_id) {
            Some(Interest::Session(session_id)) => {
                if let Some(room) = self.rooms.get_mut(&session_id) {
                    room.remove(subscriber_id);
                    if room.is_empty() {
                        self.rooms.remove(&session_id);
                    }
                }
            }
            Some(Interest::Matchmaking(connection_id)) => {
                self.match_waiters.remove(&connection_id);
            }
            Some(Interest::Lobby) => {
                self.lobby.remove(subscriber_id);
            }
            None => {}
        }
    }

    /// Delivers a frame to each target; targets whose mailbox is full are
    /// reaped on the spot.
    fn deliver(&mut self, targets: Vec<Uuid>, frame: &str) {
        for id in targets {
            let Some(recipient) = self.subscribers.get(&id) else {
                continue;
            };
            if recipient.try_send(PushFrame(frame.to_string())).is_err() {
                log::warn!("push subscriber {} fell behind, dropping it", id);
                self.remove(&id);
            }
        }
    }
}

impl Actor for SessionHub {
    type Context = Context<Self>;
}

impl Handler<Connect> for SessionHub {
    type Result = ();

    fn handle(&mut self, msg: Connect, _ctx: &mut Context<Self>) {
        log::debug!("subscriber {} connected ({:?})", msg.subscriber_id, msg.interest);
        self.subscribers.insert(msg.subscriber_id, msg.addr);
        match &msg.interest {
            Interest::Session(session_id) => {
                self.rooms
                    .entry(*session_id)
                    .or_default()
                    .insert(msg.subscriber_id);
            }
            Interest::Matchmaking(connection_id) => {
                self.match_waiters
                    .insert(connection_id.clone(), msg.subscriber_id);
            }
            Interest::Lobby => {
                self.lobby.insert(msg.subscriber_id);
            }
        }
        self.interests.insert(msg.subscriber_id, msg.interest);
    }
}

impl Handler<Disconnect> for SessionHub {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _ctx: &mut Context<Self>) {
        log::debug!("subscriber {} disconnected", msg.subscriber_id);
        self.remove(&msg.subscriber_id);
    }
}

impl Handler<BroadcastSession> for SessionHub {
    type Result = ();

    fn handle(&mut self, msg: BroadcastSession, _ctx: &mut Context<Self>) {
        let targets: Vec<Uuid> = self
            .rooms
            .get(&msg.session_id)
            .map(|room| room.iter().copied().collect())
            .unwrap_or_default();
        self.deliver(targets, &msg.frame);
    }
}

impl Handler<NotifyMatchFound> for SessionHub {
    type Result = ();

    fn handle(&mut self, msg: NotifyMatchFound, _ctx: &mut Context<Self>) {
        let targets: Vec<Uuid> = self
            .match_waiters
            .get(&msg.connection_id)
            .map(|id| vec![*id])
            .unwrap_or_default();
        self.deliver(targets, &msg.frame);
    }
}

impl Handler<BroadcastLobby> for SessionHub {
    type Result = ();

    fn handle(&mut self, msg: BroadcastLobby, _ctx: &mut Context<Self>) {
        let targets: Vec<Uuid> = self.lobby.iter().copied().collect();
        self.deliver(targets, &msg.frame);
    }
}
