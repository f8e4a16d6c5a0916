//! Push channels.
//!
//! Three WebSocket endpoints, one per logical channel:
//!
//! | Path                           | Frames                                        |
//! |--------------------------------|-----------------------------------------------|
//! | `/ws/games/{sessionId}`        | `game_update`, `move`, `player_joined`, `resignation`, `game_over`, `draw_offered`, `draw_declined`, `time_update` |
//! | `/ws/matchmaking/{connectionId}` | `match_found`                               |
//! | `/ws/lobby`                    | `lobby_update`                                |
//!
//! Frames are JSON, server-to-client only, and every frame carries
//! `serverTime`. Clients that reconnect refetch the authoritative state
//! over the read API first — the hub buffers nothing.
//!
//! A game channel requires either a `playerId` that is seated in the game
//! or `spectator=true`; the matchmaking channel is open to the connection
//! id it names, which may enter the queue after connecting.

use crate::api::AppState;
use crate::bus::EventBus;
use crate::error::ApiError;
use crate::hub::{Connect, Disconnect, Interest, PushFrame, SessionHub};
use crate::model::EventPayload;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How often the server pings to keep the connection alive and detect
/// stale clients.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// How long without a pong before the connection is considered dead.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// PushSession — per-connection actor
// ---------------------------------------------------------------------------

/// One push-channel connection. It registers its interest with the hub on
/// start, forwards hub frames to the socket, and otherwise only maintains
/// the heartbeat. Client-to-server frames are not part of the protocol.
pub struct PushSession {
    id: Uuid,
    interest: Interest,
    hub: Addr<SessionHub>,
    /// A snapshot frame sent right after the subscription lands, so the
    /// client starts from the current state before incremental frames.
    initial_frame: Option<String>,
    last_heartbeat: Instant,
}

impl PushSession {
    pub fn new(interest: Interest, hub: Addr<SessionHub>, initial_frame: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            interest,
            hub,
            initial_frame,
            last_heartbeat: Instant::now(),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                log::warn!("push session {} heartbeat timeout, disconnecting", act.id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for PushSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        log::debug!("push session {} started ({:?})", self.id, self.interest);
        self.start_heartbeat(ctx);
        self.hub.do_send(Connect {
            subscriber_id: self.id,
            interest: self.interest.clone(),
            addr: ctx.address().recipient(),
        });
        if let Some(frame) = self.initial_frame.take() {
            ctx.text(frame);
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        log::debug!("push session {} stopped", self.id);
        self.hub.do_send(Disconnect {
            subscriber_id: self.id,
        });
    }
}

impl Handler<PushFrame> for PushSession {
    type Result = ();

    fn handle(&mut self, msg: PushFrame, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PushSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            // Inbound text/binary frames are not part of the protocol.
            Ok(ws::Message::Text(_)) | Ok(ws::Message::Binary(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                log::warn!("push session {} protocol error: {}", self.id, err);
                ctx.stop();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Upgrade handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameChannelQuery {
    pub player_id: Option<String>,
    pub spectator: Option<bool>,
}

/// `GET /ws/games/{sessionId}?playerId=..` or `?spectator=true`.
pub async fn game_channel(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    query: web::Query<GameChannelQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let session_id = Uuid::parse_str(&path.into_inner())
        .map_err(|_| ApiError::Validation("invalid session id".to_string()))?;
    let game = state.games.get_game(session_id).await?;

    match (&query.player_id, query.spectator.unwrap_or(false)) {
        (Some(player_id), _) => {
            if game.color_of(player_id).is_none() {
                return Err(ApiError::Forbidden(
                    "playerId is not seated in this game".to_string(),
                )
                .into());
            }
        }
        (None, true) => {}
        (None, false) => {
            return Err(ApiError::Validation(
                "playerId or spectator=true is required".to_string(),
            )
            .into());
        }
    }

    let initial = EventBus::render_frame(&EventPayload::GameUpdate { game });
    let session = PushSession::new(Interest::Session(session_id), state.hub.clone(), initial);
    ws::start(session, &req, stream)
}

/// `GET /ws/matchmaking/{connectionId}`.
pub async fn matchmaking_channel(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let connection_id = path.into_inner();
    if connection_id.is_empty() {
        return Err(ApiError::Validation("connectionId is required".to_string()).into());
    }
    let session = PushSession::new(Interest::Matchmaking(connection_id), state.hub.clone(), None);
    ws::start(session, &req, stream)
}

/// `GET /ws/lobby`.
pub async fn lobby_channel(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let entries = state.matchmaker.lobby().await?;
    let initial = EventBus::render_frame(&EventPayload::LobbyUpdate { entries });
    let session = PushSession::new(Interest::Lobby, state.hub.clone(), initial);
    ws::start(session, &req, stream)
}
