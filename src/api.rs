//! The public REST API.
//!
//! Thin translation between HTTP and the subsystems: every handler
//! resolves identity, parses its input, calls one state-machine or
//! matchmaker operation, and renders the result. All game mutations and
//! queue changes happen behind those calls; nothing here touches game
//! state directly.
//!
//! Documented with OpenAPI via `utoipa`; Swagger UI is served at
//! `/swagger-ui/`.

use crate::auth;
use crate::config::Config;
use crate::error::{ApiError, ErrorBody};
use crate::game::{GameManager, GameSnapshot};
use crate::hub::SessionHub;
use crate::matchmaker::{JoinQueueRequest, Matchmaker, QueueStatusView};
use crate::model::*;
use crate::store::{GameStore, LadderKind};
use crate::types::Color;
use actix::Addr;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

/// Shared application state handed to every handler.
pub struct AppState {
    pub store: GameStore,
    pub games: Arc<GameManager>,
    pub matchmaker: Arc<Matchmaker>,
    pub hub: Addr<SessionHub>,
    pub config: Config,
}

fn parse_session_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::Validation(format!("invalid session id: {}", raw)))
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateGameRequest {
    /// Named time control; omit for an unclocked game.
    pub time_control: Option<TimeControlMode>,
    pub client_software: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateGameResponse {
    pub session_id: Uuid,
    /// The creator's seat token; required for every mutation.
    pub player_id: String,
    pub share_link: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JoinGameRequest {
    /// Supply a previous token to reclaim a seat after a reconnect.
    pub player_id: Option<String>,
    pub display_name: String,
    pub agent_name: Option<String>,
    pub client_software: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    pub player_id: String,
    pub from: String,
    pub to: String,
    /// "Q", "R", "B" or "N"; required exactly when a pawn reaches the
    /// last rank.
    pub promotion: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MoveResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The FEN after the move.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board_state: Option<String>,
    pub check: bool,
    pub checkmate: bool,
    pub stalemate: bool,
    pub draw: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRequest {
    pub player_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OfferDrawResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_declined: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_decline_message: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RespondDrawRequest {
    pub player_id: String,
    pub accept: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimDrawRequest {
    pub player_id: String,
    /// "threefold_repetition" or "fifty_moves".
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveGamesQuery {
    pub limit: Option<i64>,
    pub inactive_mins: Option<i64>,
    pub ranked: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedGamesQuery {
    pub limit: Option<i64>,
    pub ranked: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameListResponse {
    pub games: Vec<GameSnapshot>,
    pub total: usize,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MoveListResponse {
    pub session_id: Uuid,
    pub moves: Vec<MoveRow>,
    pub total: usize,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchmakingJoinRequest {
    pub connection_id: String,
    pub display_name: String,
    pub agent_name: Option<String>,
    pub engine_name: Option<String>,
    pub is_ranked: bool,
    pub preferred_color: Option<Color>,
    pub opponent_type: OpponentType,
    pub time_controls: Vec<TimeControlMode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionQuery {
    pub connection_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardQuery {
    /// "players" (default) or "agents".
    #[serde(rename = "type")]
    pub ladder: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardResponse {
    #[serde(rename = "type")]
    pub ladder: String,
    /// Ladder rows: [`UserRating`] or [`AgentRating`] depending on type.
    #[schema(value_type = Object)]
    pub entries: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupQuery {
    pub display_name: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserLookupResponse {
    pub user_id: String,
    pub display_name: String,
    pub elo: i32,
    pub games_played: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGamesQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    /// "win", "loss" or "draw", relative to the listed user.
    pub result: Option<String>,
    pub ranked: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserGamesResponse {
    pub user_id: String,
    pub games: Vec<MatchHistoryEntry>,
    pub page: i64,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// OpenAPI definition
// ---------------------------------------------------------------------------

/// OpenAPI documentation for the public API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Matchroom — Multiplayer Chess Server",
        version = "0.3.0",
        description = "A stateful chess session server: authoritative rules, per-game \
            clocks, matchmaking with builtin-agent fallback, cross-node push \
            channels, and Elo ladders for players and agents.",
        license(name = "MIT")
    ),
    paths(
        create_game,
        list_active_games,
        list_completed_games,
        get_game,
        join_game,
        submit_move,
        resign,
        offer_draw,
        respond_draw,
        claim_draw,
        list_moves,
        matchmaking_join,
        matchmaking_leave,
        matchmaking_status,
        matchmaking_lobby,
        leaderboard,
        user_lookup,
        user_games,
    ),
    components(schemas(
        CreateGameRequest,
        CreateGameResponse,
        JoinGameRequest,
        MoveRequest,
        MoveResponse,
        PlayerRequest,
        OfferDrawResponse,
        RespondDrawRequest,
        ClaimDrawRequest,
        GameListResponse,
        MoveListResponse,
        MatchmakingJoinRequest,
        LeaderboardResponse,
        UserLookupResponse,
        UserGamesResponse,
        GameSnapshot,
        GameRecord,
        PlayerSlot,
        DrawOffers,
        PlayerClock,
        PlayerTimes,
        TimeControl,
        TimeControlMode,
        EloChanges,
        MoveRow,
        MatchHistoryEntry,
        HistorySide,
        UserRating,
        AgentRating,
        QueueEntry,
        QueueStatus,
        QueueStatusView,
        LobbyEntry,
        OpponentType,
        GameStatus,
        GameType,
        WinReason,
        Color,
        ErrorBody,
    )),
    tags(
        (name = "games", description = "Game lifecycle and play"),
        (name = "matchmaking", description = "Queue, pairing and the lobby"),
        (name = "ratings", description = "Leaderboards and match history"),
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Games
// ---------------------------------------------------------------------------

/// Create a game with the caller seated as white.
///
/// Anonymous creation is allowed; games created here are always casual.
#[utoipa::path(
    post,
    path = "/api/games",
    tag = "games",
    request_body = CreateGameRequest,
    responses(
        (status = 201, description = "Game created", body = CreateGameResponse),
        (status = 400, description = "Invalid time control", body = ErrorBody),
    )
)]
pub async fn create_game(
    req: HttpRequest,
    body: web::Json<CreateGameRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let caller = auth::resolve(&req, &state.store, &state.config).await?;

    let player_id = Uuid::new_v4().to_string();
    let slot = PlayerSlot {
        player_id: player_id.clone(),
        display_name: caller
            .as_ref()
            .map(|u| u.display_name.clone())
            .unwrap_or_else(|| "Anonymous".to_string()),
        user_id: caller.map(|u| u.user_id),
        agent_name: None,
        engine_name: None,
        elo_at_join: None,
        client_software: body.client_software.clone(),
    };
    let time_control = body.time_control.map(TimeControl::from_mode);
    let game = state.games.create_game(slot, time_control).await?;

    let share_link = format!(
        "{}/games/{}",
        state.config.frontend_url.trim_end_matches('/'),
        game.session_id
    );
    Ok(HttpResponse::Created().json(CreateGameResponse {
        session_id: game.session_id,
        player_id,
        share_link,
    }))
}

/// List active games.
#[utoipa::path(
    get,
    path = "/api/games/active",
    tag = "games",
    params(
        ("limit" = Option<i64>, Query, description = "Maximum rows (default 20)"),
        ("inactiveMins" = Option<i64>, Query, description = "Hide games idle longer than this"),
        ("ranked" = Option<bool>, Query, description = "Filter by ranked flag"),
    ),
    responses((status = 200, description = "Active games", body = GameListResponse))
)]
pub async fn list_active_games(
    query: web::Query<ActiveGamesQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let games = state
        .store
        .list_active_games(limit, query.inactive_mins, query.ranked, now_ms())
        .await?;
    let games: Vec<GameSnapshot> = games.iter().map(|g| state.games.snapshot(g)).collect();
    let total = games.len();
    Ok(HttpResponse::Ok().json(GameListResponse { games, total }))
}

/// List completed games.
#[utoipa::path(
    get,
    path = "/api/games/completed",
    tag = "games",
    params(
        ("limit" = Option<i64>, Query, description = "Maximum rows (default 20)"),
        ("ranked" = Option<bool>, Query, description = "Filter by ranked flag"),
    ),
    responses((status = 200, description = "Completed games", body = GameListResponse))
)]
pub async fn list_completed_games(
    query: web::Query<CompletedGamesQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let games = state
        .store
        .list_completed_games(limit, query.ranked)
        .await?;
    let games: Vec<GameSnapshot> = games.iter().map(|g| state.games.snapshot(g)).collect();
    let total = games.len();
    Ok(HttpResponse::Ok().json(GameListResponse { games, total }))
}

/// Get the full game snapshot.
///
/// Includes `serverTime` for clock sync and the computed
/// `canClaimThreefold` / `canClaimFiftyMoves` flags.
#[utoipa::path(
    get,
    path = "/api/games/{session_id}",
    tag = "games",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Game snapshot", body = GameSnapshot),
        (status = 404, description = "Unknown session", body = ErrorBody),
    )
)]
pub async fn get_game(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session_id = parse_session_id(&path.into_inner())?;
    let game = state.games.get_game(session_id).await?;
    Ok(HttpResponse::Ok().json(state.games.snapshot(&game)))
}

/// Join a game in the free seat.
///
/// Rejoining with a known `playerId` returns the same seat. Ranked games
/// require authentication.
#[utoipa::path(
    post,
    path = "/api/games/{session_id}/join",
    tag = "games",
    params(("session_id" = String, Path, description = "Session id")),
    request_body = JoinGameRequest,
    responses(
        (status = 200, description = "Seated; full snapshot", body = GameSnapshot),
        (status = 401, description = "Ranked game without authentication", body = ErrorBody),
        (status = 404, description = "Unknown session", body = ErrorBody),
        (status = 409, description = "Game already full", body = ErrorBody),
    )
)]
pub async fn join_game(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<JoinGameRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session_id = parse_session_id(&path.into_inner())?;
    let caller = auth::resolve(&req, &state.store, &state.config).await?;

    let slot = PlayerSlot {
        player_id: body.player_id.clone().unwrap_or_default(),
        display_name: body.display_name.clone(),
        user_id: caller.map(|u| u.user_id),
        agent_name: body.agent_name.clone(),
        engine_name: None,
        elo_at_join: None,
        client_software: body.client_software.clone(),
    };
    let outcome = state.games.join(session_id, slot).await?;

    let mut snapshot = serde_json::to_value(state.games.snapshot(&outcome.game))
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if let Some(map) = snapshot.as_object_mut() {
        map.insert("playerId".to_string(), serde_json::json!(outcome.player_id));
        map.insert("color".to_string(), serde_json::json!(outcome.color));
    }
    Ok(HttpResponse::Ok().json(snapshot))
}

/// Submit a move.
///
/// Rules rejections come back as `{success: false, error}` with a 4xx
/// status, never a 5xx.
#[utoipa::path(
    post,
    path = "/api/games/{session_id}/move",
    tag = "games",
    params(("session_id" = String, Path, description = "Session id")),
    request_body = MoveRequest,
    responses(
        (status = 200, description = "Move applied", body = MoveResponse),
        (status = 400, description = "Illegal or malformed move", body = MoveResponse),
        (status = 403, description = "Not a seat in this game", body = ErrorBody),
        (status = 404, description = "Unknown session", body = ErrorBody),
        (status = 409, description = "Wrong turn or lost race", body = MoveResponse),
    )
)]
pub async fn submit_move(
    path: web::Path<String>,
    body: web::Json<MoveRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session_id = parse_session_id(&path.into_inner())?;

    match state
        .games
        .make_move(
            session_id,
            &body.player_id,
            &body.from,
            &body.to,
            body.promotion.as_deref(),
        )
        .await
    {
        Ok(applied) => Ok(HttpResponse::Ok().json(MoveResponse {
            success: true,
            error: None,
            board_state: Some(applied.game.fen.clone()),
            check: applied.check,
            checkmate: applied.checkmate,
            stalemate: applied.stalemate,
            draw: applied.draw.is_some(),
        })),
        // Move-level rejections keep the documented body shape.
        Err(err @ (ApiError::Validation(_) | ApiError::IllegalMove(_) | ApiError::Conflict(_))) => {
            let status = match &err {
                ApiError::Conflict(_) => actix_web::http::StatusCode::CONFLICT,
                _ => actix_web::http::StatusCode::BAD_REQUEST,
            };
            Ok(HttpResponse::build(status).json(MoveResponse {
                success: false,
                error: Some(err.to_string()),
                board_state: None,
                check: false,
                checkmate: false,
                stalemate: false,
                draw: false,
            }))
        }
        Err(err) => Err(err),
    }
}

/// Resign the game.
#[utoipa::path(
    post,
    path = "/api/games/{session_id}/resign",
    tag = "games",
    params(("session_id" = String, Path, description = "Session id")),
    request_body = PlayerRequest,
    responses(
        (status = 200, description = "Resignation applied", body = GameSnapshot),
        (status = 404, description = "Unknown session", body = ErrorBody),
        (status = 409, description = "Game not active", body = ErrorBody),
    )
)]
pub async fn resign(
    path: web::Path<String>,
    body: web::Json<PlayerRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session_id = parse_session_id(&path.into_inner())?;
    let game = state.games.resign(session_id, &body.player_id).await?;
    Ok(HttpResponse::Ok().json(state.games.snapshot(&game)))
}

/// Offer a draw.
///
/// Each color may offer at most three times per game. If the opponent
/// auto-declines, the response says so and no offer is left pending.
#[utoipa::path(
    post,
    path = "/api/games/{session_id}/offer-draw",
    tag = "games",
    params(("session_id" = String, Path, description = "Session id")),
    request_body = PlayerRequest,
    responses(
        (status = 200, description = "Offer placed or auto-declined", body = OfferDrawResponse),
        (status = 409, description = "Offer pending or budget exhausted", body = ErrorBody),
    )
)]
pub async fn offer_draw(
    path: web::Path<String>,
    body: web::Json<PlayerRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session_id = parse_session_id(&path.into_inner())?;
    let outcome = state.games.offer_draw(session_id, &body.player_id).await?;
    Ok(HttpResponse::Ok().json(OfferDrawResponse {
        success: true,
        auto_declined: outcome.auto_declined.then_some(true),
        auto_decline_message: outcome
            .auto_declined
            .then(|| "your opponent automatically declines draw offers".to_string()),
    }))
}

/// Respond to a pending draw offer.
#[utoipa::path(
    post,
    path = "/api/games/{session_id}/respond-draw",
    tag = "games",
    params(("session_id" = String, Path, description = "Session id")),
    request_body = RespondDrawRequest,
    responses(
        (status = 200, description = "Response applied", body = GameSnapshot),
        (status = 409, description = "No pending offer for this seat", body = ErrorBody),
    )
)]
pub async fn respond_draw(
    path: web::Path<String>,
    body: web::Json<RespondDrawRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session_id = parse_session_id(&path.into_inner())?;
    let game = state
        .games
        .respond_draw(session_id, &body.player_id, body.accept)
        .await?;
    Ok(HttpResponse::Ok().json(state.games.snapshot(&game)))
}

/// Claim a draw by rule.
#[utoipa::path(
    post,
    path = "/api/games/{session_id}/claim-draw",
    tag = "games",
    params(("session_id" = String, Path, description = "Session id")),
    request_body = ClaimDrawRequest,
    responses(
        (status = 200, description = "Claim accepted, game drawn", body = GameSnapshot),
        (status = 409, description = "Claim condition unsatisfied", body = ErrorBody),
    )
)]
pub async fn claim_draw(
    path: web::Path<String>,
    body: web::Json<ClaimDrawRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session_id = parse_session_id(&path.into_inner())?;
    let reason = match body.reason.as_str() {
        "threefold_repetition" => WinReason::ThreefoldRepetition,
        "fifty_moves" => WinReason::FiftyMoves,
        other => {
            return Err(ApiError::Validation(format!(
                "unknown draw claim reason: {}",
                other
            )));
        }
    };
    let game = state
        .games
        .claim_draw(session_id, &body.player_id, reason)
        .await?;
    Ok(HttpResponse::Ok().json(state.games.snapshot(&game)))
}

/// The ordered move list of a game.
#[utoipa::path(
    get,
    path = "/api/games/{session_id}/moves",
    tag = "games",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Moves in order", body = MoveListResponse),
        (status = 404, description = "Unknown session", body = ErrorBody),
    )
)]
pub async fn list_moves(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let session_id = parse_session_id(&path.into_inner())?;
    // 404 for unknown sessions, not an empty list.
    state.games.get_game(session_id).await?;
    let moves = state.store.list_moves(session_id).await?;
    let total = moves.len();
    Ok(HttpResponse::Ok().json(MoveListResponse {
        session_id,
        moves,
        total,
    }))
}

// ---------------------------------------------------------------------------
// Matchmaking
// ---------------------------------------------------------------------------

/// Enter the matchmaking queue.
#[utoipa::path(
    post,
    path = "/api/matchmaking/join",
    tag = "matchmaking",
    request_body = MatchmakingJoinRequest,
    responses(
        (status = 200, description = "Queued", body = QueueEntry),
        (status = 400, description = "No time controls given", body = ErrorBody),
        (status = 401, description = "Ranked without authentication", body = ErrorBody),
    )
)]
pub async fn matchmaking_join(
    req: HttpRequest,
    body: web::Json<MatchmakingJoinRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let caller = auth::resolve(&req, &state.store, &state.config).await?;
    let body = body.into_inner();
    let entry = state
        .matchmaker
        .join_queue(JoinQueueRequest {
            connection_id: body.connection_id,
            user_id: caller.map(|u| u.user_id),
            display_name: body.display_name,
            agent_name: body.agent_name,
            engine_name: body.engine_name,
            is_ranked: body.is_ranked,
            preferred_color: body.preferred_color,
            opponent_type: body.opponent_type,
            time_controls: body.time_controls,
        })
        .await?;
    Ok(HttpResponse::Ok().json(entry))
}

/// Leave the queue.
#[utoipa::path(
    post,
    path = "/api/matchmaking/leave",
    tag = "matchmaking",
    params(("connectionId" = String, Query, description = "Connection id")),
    responses(
        (status = 200, description = "Removed"),
        (status = 404, description = "No such entry", body = ErrorBody),
    )
)]
pub async fn matchmaking_leave(
    query: web::Query<ConnectionQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    if state.matchmaker.leave_queue(&query.connection_id).await? {
        Ok(HttpResponse::Ok().json(serde_json::json!({ "left": true })))
    } else {
        Err(ApiError::NotFound(format!(
            "no queue entry for {}",
            query.connection_id
        )))
    }
}

/// Queue position and match state for one connection.
#[utoipa::path(
    get,
    path = "/api/matchmaking/status",
    tag = "matchmaking",
    params(("connectionId" = String, Query, description = "Connection id")),
    responses(
        (status = 200, description = "Queue status", body = QueueStatusView),
        (status = 404, description = "No such entry", body = ErrorBody),
    )
)]
pub async fn matchmaking_status(
    query: web::Query<ConnectionQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let status = state.matchmaker.status(&query.connection_id).await?;
    Ok(HttpResponse::Ok().json(status))
}

/// The public lobby: everyone currently waiting.
#[utoipa::path(
    get,
    path = "/api/matchmaking/lobby",
    tag = "matchmaking",
    responses((status = 200, description = "Waiting entries", body = [LobbyEntry]))
)]
pub async fn matchmaking_lobby(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let entries = state.matchmaker.lobby().await?;
    Ok(HttpResponse::Ok().json(entries))
}

// ---------------------------------------------------------------------------
// Ratings & users
// ---------------------------------------------------------------------------

/// Top of a ladder, Elo descending.
#[utoipa::path(
    get,
    path = "/api/leaderboard",
    tag = "ratings",
    params(
        ("type" = Option<String>, Query, description = "players (default) or agents"),
        ("limit" = Option<i64>, Query, description = "Maximum rows (default 20)"),
    ),
    responses(
        (status = 200, description = "Ladder rows", body = LeaderboardResponse),
        (status = 400, description = "Unknown ladder", body = ErrorBody),
    )
)]
pub async fn leaderboard(
    query: web::Query<LeaderboardQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let ladder = query.ladder.as_deref().unwrap_or("players");
    let kind = match ladder {
        "players" => LadderKind::Players,
        "agents" => LadderKind::Agents,
        other => {
            return Err(ApiError::Validation(format!(
                "unknown leaderboard type: {}",
                other
            )));
        }
    };
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let entries = state.store.leaderboard(kind, limit).await?;
    Ok(HttpResponse::Ok().json(LeaderboardResponse {
        ladder: ladder.to_string(),
        entries,
    }))
}

/// Look a user up by display name.
#[utoipa::path(
    get,
    path = "/api/users/lookup",
    tag = "ratings",
    params(("displayName" = String, Query, description = "Exact display name")),
    responses(
        (status = 200, description = "User found", body = UserLookupResponse),
        (status = 404, description = "Unknown user", body = ErrorBody),
    )
)]
pub async fn user_lookup(
    query: web::Query<LookupQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let user = state
        .store
        .find_user_by_display_name(&query.display_name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown user: {}", query.display_name)))?;
    let rating = state.store.get_user_rating(&user.user_id).await?;
    Ok(HttpResponse::Ok().json(UserLookupResponse {
        user_id: user.user_id,
        display_name: user.display_name,
        elo: rating.as_ref().map(|r| r.elo).unwrap_or(DEFAULT_ELO),
        games_played: rating.map(|r| r.games_played).unwrap_or(0),
    }))
}

/// A user's completed games.
///
/// Ranked rows are visible to everyone; unranked rows only to the user
/// themselves.
#[utoipa::path(
    get,
    path = "/api/users/{user_id}/games",
    tag = "ratings",
    params(
        ("user_id" = String, Path, description = "User id"),
        ("page" = Option<i64>, Query, description = "1-based page (default 1)"),
        ("limit" = Option<i64>, Query, description = "Rows per page (default 20)"),
        ("result" = Option<String>, Query, description = "win, loss or draw, relative to the user"),
        ("ranked" = Option<bool>, Query, description = "Filter by ranked flag"),
    ),
    responses((status = 200, description = "Match history", body = UserGamesResponse))
)]
pub async fn user_games(
    req: HttpRequest,
    path: web::Path<String>,
    query: web::Query<UserGamesQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    let caller = auth::resolve(&req, &state.store, &state.config).await?;
    let is_owner = caller.as_ref().is_some_and(|u| u.user_id == user_id);

    // Explicitly asking for unranked rows is an owner-only view.
    if query.ranked == Some(false) && !is_owner {
        return Err(ApiError::Forbidden(
            "unranked games are only visible to their owner".to_string(),
        ));
    }
    let ranked_only = query.ranked.unwrap_or(false) || !is_owner;

    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let mut games = state
        .store
        .list_user_games(&user_id, page, limit, ranked_only)
        .await?;

    if query.ranked == Some(false) {
        games.retain(|g| !g.is_ranked);
    }
    if let Some(result) = query.result.as_deref() {
        games.retain(|g| {
            let side = if g.white.user_id.as_deref() == Some(user_id.as_str()) {
                Color::White
            } else {
                Color::Black
            };
            match result {
                "win" => g.winner == Some(side),
                "loss" => g.winner.is_some() && g.winner != Some(side),
                "draw" => g.winner.is_none(),
                _ => true,
            }
        });
    }

    let total = games.len();
    Ok(HttpResponse::Ok().json(UserGamesResponse {
        user_id,
        games,
        page,
        total,
    }))
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// Registers every REST route. Static prefixes come before the
/// `{session_id}` catch-all so `/games/active` is not read as a session.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/games", web::post().to(create_game))
            .route("/games/active", web::get().to(list_active_games))
            .route("/games/completed", web::get().to(list_completed_games))
            .route("/games/{session_id}", web::get().to(get_game))
            .route("/games/{session_id}/join", web::post().to(join_game))
            .route("/games/{session_id}/move", web::post().to(submit_move))
            .route("/games/{session_id}/resign", web::post().to(resign))
            .route("/games/{session_id}/offer-draw", web::post().to(offer_draw))
            .route(
                "/games/{session_id}/respond-draw",
                web::post().to(respond_draw),
            )
            .route("/games/{session_id}/claim-draw", web::post().to(claim_draw))
            .route("/games/{session_id}/moves", web::get().to(list_moves))
            .route("/matchmaking/join", web::post().to(matchmaking_join))
            .route("/matchmaking/leave", web::post().to(matchmaking_leave))
            .route("/matchmaking/status", web::get().to(matchmaking_status))
            .route("/matchmaking/lobby", web::get().to(matchmaking_lobby))
            .route("/leaderboard", web::get().to(leaderboard))
            .route("/users/lookup", web::get().to(user_lookup))
            .route("/users/{user_id}/games", web::get().to(user_games)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::store::{connect, UserAccount};
    use actix::Actor;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use serde_json::json;

    async fn test_state() -> web::Data<AppState> {
        let pool = connect("sqlite::memory:").await.unwrap();
        let store = GameStore::new(pool);
        store.init_schema().await.unwrap();
        let hub = SessionHub::new().start();
        let bus = Arc::new(EventBus::new(store.clone(), Some(hub.clone()), Uuid::new_v4()));
        let games = GameManager::new(store.clone(), bus.clone(), Config::default());
        let matchmaker = Matchmaker::new(store.clone(), bus, games.clone(), Config::default(), None);
        web::Data::new(AppState {
            store,
            games,
            matchmaker,
            hub,
            config: Config::default(),
        })
    }

    fn seat(player_id: &str, name: &str) -> PlayerSlot {
        PlayerSlot {
            player_id: player_id.to_string(),
            display_name: name.to_string(),
            user_id: None,
            agent_name: None,
            engine_name: None,
            elo_at_join: None,
            client_software: None,
        }
    }

    fn history_entry(user_id: &str, ranked: bool) -> MatchHistoryEntry {
        MatchHistoryEntry {
            session_id: Uuid::new_v4(),
            white: HistorySide {
                display_name: "Ann".into(),
                user_id: Some(user_id.to_string()),
                agent_name: None,
                start_elo: Some(1200),
                end_elo: Some(1210),
                delta: Some(10),
            },
            black: HistorySide {
                display_name: "Rival".into(),
                user_id: Some("u-rival".into()),
                agent_name: None,
                start_elo: Some(1200),
                end_elo: Some(1190),
                delta: Some(-10),
            },
            winner: Some(Color::White),
            win_reason: Some(WinReason::Checkmate),
            total_moves: 4,
            duration_ms: 60_000,
            is_ranked: ranked,
            completed_at: now_ms(),
        }
    }

    #[actix_web::test]
    async fn move_rejections_keep_the_success_false_contract() {
        let state = test_state().await;
        let app =
            test::init_service(App::new().app_data(state.clone()).configure(configure_routes))
                .await;

        let game = state
            .games
            .create_game(seat("p1", "Alice"), None)
            .await
            .unwrap();
        state
            .games
            .join(game.session_id, seat("p2", "Bob"))
            .await
            .unwrap();

        let post = |body: serde_json::Value| {
            test::TestRequest::post()
                .uri(&format!("/api/games/{}/move", game.session_id))
                .set_json(body)
                .to_request()
        };

        // An illegal move is a 400 with the documented body, never a 5xx.
        let resp = test::call_service(
            &app,
            post(json!({"playerId": "p1", "from": "e2", "to": "e5"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());

        // Out of turn is a state conflict, same body shape.
        let resp = test::call_service(
            &app,
            post(json!({"playerId": "p2", "from": "e7", "to": "e5"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], false);

        // A legal move succeeds and reports the new board.
        let resp = test::call_service(
            &app,
            post(json!({"playerId": "p1", "from": "e2", "to": "e4"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], true);
        assert!(body["boardState"].as_str().unwrap().contains(" b "));

        // An unknown session is a plain 404.
        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri(&format!("/api/games/{}/move", Uuid::new_v4()))
                .set_json(json!({"playerId": "p1", "from": "e2", "to": "e4"}))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn unranked_history_is_visible_to_the_owner_only() {
        let state = test_state().await;
        state
            .store
            .upsert_user(
                &UserAccount {
                    user_id: "u-ann".into(),
                    display_name: "Ann".into(),
                    api_key: Some("cmk_annkey".into()),
                    auto_decline_draws: false,
                },
                now_ms(),
            )
            .await
            .unwrap();
        state
            .store
            .append_match_history(&history_entry("u-ann", true))
            .await
            .unwrap();
        state
            .store
            .append_match_history(&history_entry("u-ann", false))
            .await
            .unwrap();

        let app =
            test::init_service(App::new().app_data(state.clone()).configure(configure_routes))
                .await;

        // Anonymous viewers get the ranked row only.
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/users/u-ann/games")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["games"][0]["isRanked"], true);

        // The owner sees both rows.
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/users/u-ann/games")
                .insert_header(("X-Api-Key", "cmk_annkey"))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["total"], 2);

        // Anonymous viewers asking for unranked rows outright are refused.
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/users/u-ann/games?ranked=false")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
