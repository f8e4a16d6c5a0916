//! The game state machine.
//!
//! Every mutation to a game — join, move, resignation, draw traffic,
//! timeout — flows through [`GameManager`]: it validates the intent
//! against a freshly read record, transitions the game, persists it
//! through the store's conditional update, and emits exactly one event
//! envelope describing the outcome. Rejections return a typed error and
//! leave nothing behind: no write, no event.
//!
//! The CAS version is the serialization point. Two concurrent moves on
//! one session race on the version; the loser re-reads and retries up to
//! [`MAX_CAS_RETRIES`] times before giving up with a conflict.
//!
//! Clock timers armed here are best-effort per node; correctness lives in
//! the sweeper plus the CAS guard, the timer only makes flag falls prompt.

use crate::bus::EventBus;
use crate::config::Config;
use crate::engine;
use crate::error::ApiError;
use crate::model::*;
use crate::rating;
use crate::store::{GameStore, VersionedGame};
use crate::types::{Color, PieceKind, Position, Square};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use utoipa::ToSchema;
use uuid::Uuid;

/// Re-reads after a lost CAS race before giving up with 409.
const MAX_CAS_RETRIES: usize = 3;

/// The full game snapshot the read API and push frames carry. The claim
/// flags are computed on read and never persisted.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    #[serde(flatten)]
    pub game: GameRecord,
    /// Milliseconds since epoch at render time, for client clock sync.
    pub server_time: i64,
    pub can_claim_threefold: bool,
    pub can_claim_fifty_moves: bool,
    pub halfmove_clock: u32,
}

/// What a successful join returns.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub game: GameRecord,
    pub player_id: String,
    pub color: Color,
    /// False when an existing seat was returned for a known token.
    pub newly_seated: bool,
}

/// What a successful move returns.
#[derive(Debug, Clone)]
pub struct MoveApplied {
    pub game: GameRecord,
    pub mv: MoveRow,
    pub check: bool,
    pub checkmate: bool,
    pub stalemate: bool,
    /// Set when the move ended the game in a draw.
    pub draw: Option<WinReason>,
}

/// What a draw offer returns.
#[derive(Debug, Clone)]
pub struct OfferOutcome {
    pub game: GameRecord,
    pub auto_declined: bool,
}

/// Ladder and history writes prepared inside the CAS-bounded section and
/// applied once the conditional update lands.
struct Completion {
    user_ratings: Vec<UserRating>,
    agent_ratings: Vec<AgentRating>,
    history: MatchHistoryEntry,
}

/// One side's current ladder row (or a fresh one at the default rating).
enum LadderRow {
    User(UserRating),
    Agent(AgentRating),
}

impl LadderRow {
    fn elo(&self) -> i32 {
        match self {
            LadderRow::User(r) => r.elo,
            LadderRow::Agent(r) => r.elo,
        }
    }

    fn games_played(&self) -> i32 {
        match self {
            LadderRow::User(r) => r.games_played,
            LadderRow::Agent(r) => r.games_played,
        }
    }

    fn apply(&mut self, new_elo: i32, outcome: SideOutcome) {
        let (elo, games, wins, losses, draws) = match self {
            LadderRow::User(r) => (&mut r.elo, &mut r.games_played, &mut r.wins, &mut r.losses, &mut r.draws),
            LadderRow::Agent(r) => (&mut r.elo, &mut r.games_played, &mut r.wins, &mut r.losses, &mut r.draws),
        };
        *elo = new_elo;
        *games += 1;
        match outcome {
            SideOutcome::Win => *wins += 1,
            SideOutcome::Loss => *losses += 1,
            SideOutcome::Draw => *draws += 1,
        }
    }
}

#[derive(Clone, Copy)]
enum SideOutcome {
    Win,
    Loss,
    Draw,
}

pub struct GameManager {
    store: GameStore,
    bus: Arc<EventBus>,
    config: Config,
    timers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    /// Handle to ourselves for the spawned timer tasks.
    me: Weak<GameManager>,
}

impl GameManager {
    pub fn new(store: GameStore, bus: Arc<EventBus>, config: Config) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            store,
            bus,
            config,
            timers: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    pub fn store(&self) -> &GameStore {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Builds the wire snapshot; the claim flags come from the recorded
    /// history and the FEN's halfmove clock.
    pub fn snapshot(&self, game: &GameRecord) -> GameSnapshot {
        let halfmove_clock = Position::from_fen(&game.fen)
            .map(|pos| pos.halfmove_clock)
            .unwrap_or(0);
        let active = game.status == GameStatus::Active;
        GameSnapshot {
            can_claim_threefold: active && game.current_position_repetitions() >= 3,
            can_claim_fifty_moves: active && halfmove_clock >= 100,
            halfmove_clock,
            server_time: now_ms(),
            game: game.clone(),
        }
    }

    pub async fn get_game(&self, session_id: Uuid) -> Result<GameRecord, ApiError> {
        Ok(self.read(session_id).await?.game)
    }

    async fn read(&self, session_id: Uuid) -> Result<VersionedGame, ApiError> {
        self.store
            .get_game(session_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("game {} not found", session_id)))
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Creates a casual game with the creator seated as white.
    pub async fn create_game(
        &self,
        mut creator: PlayerSlot,
        time_control: Option<TimeControl>,
    ) -> Result<GameRecord, ApiError> {
        if creator.elo_at_join.is_none() {
            creator.elo_at_join = Some(self.ladder_row_for(&creator).await?.elo());
        }
        let initial = Position::starting();
        let game = GameRecord::new(
            Uuid::new_v4(),
            Some(creator),
            time_control,
            false,
            GameType::Casual,
            initial.to_fen(),
            initial.position_key(),
            now_ms(),
        );
        self.store.create_game(&game).await?;
        log::info!("created game {}", game.session_id);
        Ok(game)
    }

    /// Creates a matchmaking game with both seats already filled; the game
    /// starts active with clocks running for white.
    pub async fn create_matched_game(
        &self,
        white: PlayerSlot,
        black: PlayerSlot,
        time_control: TimeControl,
        is_ranked: bool,
    ) -> Result<GameRecord, ApiError> {
        let now = now_ms();
        let initial = Position::starting();
        let mut game = GameRecord::new(
            Uuid::new_v4(),
            Some(white),
            Some(time_control),
            is_ranked,
            GameType::Matchmaking,
            initial.to_fen(),
            initial.position_key(),
            now,
        );
        game.black = Some(black);
        Self::start_game(&mut game, now);
        self.store.create_game(&game).await?;
        self.arm_timer_for(&game);
        log::info!(
            "created matched game {} (ranked: {})",
            game.session_id,
            is_ranked
        );
        Ok(game)
    }

    /// The waiting → active transition: stamps `startedAt` and winds the
    /// clocks with white to move.
    fn start_game(game: &mut GameRecord, now: i64) {
        game.status = GameStatus::Active;
        game.started_at = Some(now);
        if let Some(tc) = game.time_control
            && !tc.is_unlimited()
        {
            game.player_times = Some(PlayerTimes {
                white: PlayerClock {
                    remaining_ms: tc.base_ms,
                    last_move_at: Some(now),
                },
                black: PlayerClock {
                    remaining_ms: tc.base_ms,
                    last_move_at: None,
                },
            });
        }
    }

    // -----------------------------------------------------------------------
    // Join
    // -----------------------------------------------------------------------

    /// Seats a player. Rejoining with a known token returns the same seat;
    /// a third distinct token on a full game is rejected.
    pub async fn join(
        &self,
        session_id: Uuid,
        mut slot: PlayerSlot,
    ) -> Result<JoinOutcome, ApiError> {
        if slot.player_id.is_empty() {
            slot.player_id = Uuid::new_v4().to_string();
        }

        for _ in 0..MAX_CAS_RETRIES {
            let versioned = self.read(session_id).await?;
            let mut game = versioned.game;

            if let Some(color) = game.color_of(&slot.player_id) {
                return Ok(JoinOutcome {
                    player_id: slot.player_id,
                    color,
                    game,
                    newly_seated: false,
                });
            }

            if game.status == GameStatus::Complete {
                return Err(ApiError::Conflict("game is already over".to_string()));
            }
            if game.seated() == 2 {
                return Err(ApiError::Conflict("game is already full".to_string()));
            }
            if game.is_ranked && slot.user_id.is_none() {
                return Err(ApiError::Unauthorized(
                    "ranked games require authentication".to_string(),
                ));
            }

            if slot.elo_at_join.is_none() {
                slot.elo_at_join = Some(self.ladder_row_for(&slot).await?.elo());
            }

            let color = if game.white.is_none() {
                Color::White
            } else {
                Color::Black
            };
            *game.slot_mut(color) = Some(slot.clone());

            let now = now_ms();
            if game.seated() == 2 {
                Self::start_game(&mut game, now);
            }

            if self.store.update_game_cas(versioned.version, &game, now).await? {
                if game.status == GameStatus::Active {
                    self.arm_timer_for(&game);
                }
                self.bus
                    .publish(
                        Channel::Session(session_id),
                        EventPayload::PlayerJoined {
                            game: game.clone(),
                            color,
                        },
                    )
                    .await;
                log::info!("{} joined game {} as {}", slot.display_name, session_id, color);
                return Ok(JoinOutcome {
                    player_id: slot.player_id,
                    color,
                    game,
                    newly_seated: true,
                });
            }
        }
        Err(ApiError::Conflict(
            "the game changed concurrently, please retry".to_string(),
        ))
    }

    // -----------------------------------------------------------------------
    // Moves
    // -----------------------------------------------------------------------

    /// Validates and applies one move.
    pub async fn make_move(
        &self,
        session_id: Uuid,
        player_id: &str,
        from: &str,
        to: &str,
        promotion: Option<&str>,
    ) -> Result<MoveApplied, ApiError> {
        let from_sq = Square::from_algebraic(from)
            .ok_or_else(|| ApiError::Validation(format!("invalid square: {}", from)))?;
        let to_sq = Square::from_algebraic(to)
            .ok_or_else(|| ApiError::Validation(format!("invalid square: {}", to)))?;
        let promotion = match promotion {
            Some(p) => Some(PieceKind::from_promotion_letter(p).ok_or_else(|| {
                ApiError::Validation(format!("invalid promotion piece: {}", p))
            })?),
            None => None,
        };

        for _ in 0..MAX_CAS_RETRIES {
            let versioned = self.read(session_id).await?;
            let mut game = versioned.game;
            let now = now_ms();

            let mover = self.seat_for_active(&game, player_id)?;
            if mover != game.current_turn {
                return Err(ApiError::Conflict("not your turn".to_string()));
            }

            // A flag that already fell beats the move: drive the timeout
            // transition instead of applying the late move.
            if let Some(deadline) = game.deadline()
                && deadline <= now
            {
                self.try_timeout_transition(versioned.version, game, now).await?;
                return Err(ApiError::Conflict("time expired".to_string()));
            }

            let pos = Position::from_fen(&game.fen)
                .map_err(|err| ApiError::internal(format!("corrupt game fen: {}", err)))?;
            let outcome = engine::validate_move(&pos, from_sq, to_sq, promotion)?;

            // Board bookkeeping.
            game.fen = outcome.next.to_fen();
            game.current_turn = outcome.next.turn;
            game.move_count += 1;
            game.push_position_key(
                outcome.next.position_key(),
                self.config.max_position_history,
            );
            // A move supersedes any draw offer on the table.
            game.draw_offers.pending_from = None;

            // Clock bookkeeping: the mover banks the increment, the new
            // side to move starts spending from now.
            if let Some(tc) = game.time_control
                && !tc.is_unlimited()
                && let Some(times) = game.player_times.as_mut()
            {
                let clock = times.for_color_mut(mover);
                let elapsed = clock.last_move_at.map(|at| (now - at).max(0)).unwrap_or(0);
                clock.remaining_ms = clock.remaining_ms - elapsed + tc.increment_ms;
                times.for_color_mut(mover.opponent()).last_move_at = Some(now);
            }

            let mv = MoveRow {
                session_id,
                move_number: game.move_count,
                player_id: player_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
                piece: outcome.piece.letter().to_string(),
                san: outcome.san.clone(),
                capture: outcome.capture,
                check: outcome.check,
                checkmate: outcome.checkmate,
                promotion: promotion.map(|p| p.letter().to_string()),
            };

            // Terminal transitions arising from the move itself.
            let mut draw = None;
            let mut completion = None;
            if outcome.checkmate {
                completion =
                    Some(self.prepare_completion(&mut game, Some(mover), WinReason::Checkmate, now).await?);
            } else if outcome.stalemate {
                draw = Some(WinReason::Stalemate);
                completion =
                    Some(self.prepare_completion(&mut game, None, WinReason::Stalemate, now).await?);
            } else if outcome.insufficient_material {
                draw = Some(WinReason::InsufficientMaterial);
                completion = Some(
                    self.prepare_completion(&mut game, None, WinReason::InsufficientMaterial, now)
                        .await?,
                );
            }

            if self.store.update_game_cas(versioned.version, &game, now).await? {
                self.store.append_move(&mv).await?;
                let payload = match completion {
                    Some(completion) => {
                        self.apply_completion_effects(completion).await;
                        self.disarm_timer(session_id);
                        EventPayload::GameOver { game: game.clone() }
                    }
                    None => {
                        self.arm_timer_for(&game);
                        EventPayload::Move {
                            game: game.clone(),
                            mv: mv.clone(),
                        }
                    }
                };
                self.bus.publish(Channel::Session(session_id), payload).await;

                return Ok(MoveApplied {
                    check: outcome.check,
                    checkmate: outcome.checkmate,
                    stalemate: outcome.stalemate,
                    draw,
                    game,
                    mv,
                });
            }
        }
        Err(ApiError::Conflict(
            "the game changed concurrently, please retry".to_string(),
        ))
    }

    // -----------------------------------------------------------------------
    // Resignation
    // -----------------------------------------------------------------------

    pub async fn resign(
        &self,
        session_id: Uuid,
        player_id: &str,
    ) -> Result<GameRecord, ApiError> {
        for _ in 0..MAX_CAS_RETRIES {
            let versioned = self.read(session_id).await?;
            let mut game = versioned.game;
            let now = now_ms();

            let resigner = self.seat_for_active(&game, player_id)?;
            let completion = self
                .prepare_completion(&mut game, Some(resigner.opponent()), WinReason::Resignation, now)
                .await?;

            if self.store.update_game_cas(versioned.version, &game, now).await? {
                self.apply_completion_effects(completion).await;
                self.disarm_timer(session_id);
                self.bus
                    .publish(
                        Channel::Session(session_id),
                        EventPayload::Resignation {
                            game: game.clone(),
                            by: resigner,
                        },
                    )
                    .await;
                log::info!("{} resigned game {}", resigner, session_id);
                return Ok(game);
            }
        }
        Err(ApiError::Conflict(
            "the game changed concurrently, please retry".to_string(),
        ))
    }

    // -----------------------------------------------------------------------
    // Draw protocol
    // -----------------------------------------------------------------------

    /// Offers a draw. If the opponent auto-declines, the offer is resolved
    /// immediately; the offer still counts against the offerer's budget.
    pub async fn offer_draw(
        &self,
        session_id: Uuid,
        player_id: &str,
    ) -> Result<OfferOutcome, ApiError> {
        for _ in 0..MAX_CAS_RETRIES {
            let versioned = self.read(session_id).await?;
            let mut game = versioned.game;
            let now = now_ms();

            let offerer = self.seat_for_active(&game, player_id)?;
            if game.draw_offers.pending_from.is_some() {
                return Err(ApiError::Conflict(
                    "a draw offer is already pending".to_string(),
                ));
            }
            if game.draw_offers.used_by(offerer) >= MAX_DRAW_OFFERS {
                return Err(ApiError::Conflict(format!(
                    "no draw offers left (maximum {})",
                    MAX_DRAW_OFFERS
                )));
            }

            *game.draw_offers.used_by_mut(offerer) += 1;

            let auto_declined = self.opponent_auto_declines(&game, offerer).await?;
            if !auto_declined {
                game.draw_offers.pending_from = Some(offerer);
            }

            if self.store.update_game_cas(versioned.version, &game, now).await? {
                let payload = if auto_declined {
                    EventPayload::DrawDeclined {
                        game: game.clone(),
                        auto_declined: true,
                    }
                } else {
                    EventPayload::DrawOffered {
                        game: game.clone(),
                        by: offerer,
                    }
                };
                self.bus.publish(Channel::Session(session_id), payload).await;
                return Ok(OfferOutcome {
                    game,
                    auto_declined,
                });
            }
        }
        Err(ApiError::Conflict(
            "the game changed concurrently, please retry".to_string(),
        ))
    }

    async fn opponent_auto_declines(
        &self,
        game: &GameRecord,
        offerer: Color,
    ) -> Result<bool, ApiError> {
        let Some(opponent) = game.slot(offerer.opponent()).as_ref() else {
            return Ok(false);
        };
        let Some(user_id) = opponent.user_id.as_deref() else {
            return Ok(false);
        };
        Ok(self
            .store
            .get_user(user_id)
            .await?
            .is_some_and(|user| user.auto_decline_draws))
    }

    /// Accepts or declines a pending offer. Only the non-offering color
    /// may respond.
    pub async fn respond_draw(
        &self,
        session_id: Uuid,
        player_id: &str,
        accept: bool,
    ) -> Result<GameRecord, ApiError> {
        for _ in 0..MAX_CAS_RETRIES {
            let versioned = self.read(session_id).await?;
            let mut game = versioned.game;
            let now = now_ms();

            let responder = self.seat_for_active(&game, player_id)?;
            match game.draw_offers.pending_from {
                Some(offerer) if offerer == responder.opponent() => {}
                Some(_) => {
                    return Err(ApiError::Conflict(
                        "you cannot respond to your own draw offer".to_string(),
                    ));
                }
                None => {
                    return Err(ApiError::Conflict("no draw offer is pending".to_string()));
                }
            }

            game.draw_offers.pending_from = None;
            let completion = if accept {
                Some(
                    self.prepare_completion(&mut game, None, WinReason::Agreement, now)
                        .await?,
                )
            } else {
                None
            };

            if self.store.update_game_cas(versioned.version, &game, now).await? {
                let payload = match completion {
                    Some(completion) => {
                        self.apply_completion_effects(completion).await;
                        self.disarm_timer(session_id);
                        EventPayload::GameOver { game: game.clone() }
                    }
                    None => EventPayload::DrawDeclined {
                        game: game.clone(),
                        auto_declined: false,
                    },
                };
                self.bus.publish(Channel::Session(session_id), payload).await;
                return Ok(game);
            }
        }
        Err(ApiError::Conflict(
            "the game changed concurrently, please retry".to_string(),
        ))
    }

    /// A rules-based draw claim: threefold repetition or the 50-move rule.
    /// An unsatisfied claim is rejected without touching the game.
    pub async fn claim_draw(
        &self,
        session_id: Uuid,
        player_id: &str,
        reason: WinReason,
    ) -> Result<GameRecord, ApiError> {
        for _ in 0..MAX_CAS_RETRIES {
            let versioned = self.read(session_id).await?;
            let mut game = versioned.game;
            let now = now_ms();

            self.seat_for_active(&game, player_id)?;
            match reason {
                WinReason::ThreefoldRepetition => {
                    if game.current_position_repetitions() < 3 {
                        return Err(ApiError::Conflict(
                            "the current position has not occurred three times".to_string(),
                        ));
                    }
                }
                WinReason::FiftyMoves => {
                    let halfmoves = Position::from_fen(&game.fen)
                        .map(|pos| pos.halfmove_clock)
                        .unwrap_or(0);
                    if halfmoves < 100 {
                        return Err(ApiError::Conflict(format!(
                            "only {} halfmoves without capture or pawn move",
                            halfmoves
                        )));
                    }
                }
                _ => {
                    return Err(ApiError::Validation(format!(
                        "{} is not a claimable draw reason",
                        reason
                    )));
                }
            }

            let completion = self.prepare_completion(&mut game, None, reason, now).await?;

            if self.store.update_game_cas(versioned.version, &game, now).await? {
                self.apply_completion_effects(completion).await;
                self.disarm_timer(session_id);
                self.bus
                    .publish(
                        Channel::Session(session_id),
                        EventPayload::GameOver { game: game.clone() },
                    )
                    .await;
                return Ok(game);
            }
        }
        Err(ApiError::Conflict(
            "the game changed concurrently, please retry".to_string(),
        ))
    }

    // -----------------------------------------------------------------------
    // Timeout
    // -----------------------------------------------------------------------

    /// Drives the clock-expiry transition. Idempotent: a game that already
    /// completed (or whose deadline moved) is left alone, so the per-node
    /// timer, a redundant timer on another node, and the sweeper can all
    /// fire without double-completing.
    pub async fn timeout(&self, session_id: Uuid) -> Result<bool, ApiError> {
        for _ in 0..MAX_CAS_RETRIES {
            let versioned = self.read(session_id).await?;
            let game = versioned.game;
            let now = now_ms();

            if game.status != GameStatus::Active {
                return Ok(false);
            }
            let Some(deadline) = game.deadline() else {
                return Ok(false);
            };
            if deadline > now {
                return Ok(false);
            }

            if self.try_timeout_transition(versioned.version, game, now).await? {
                return Ok(true);
            }
            // Lost the race; the fresh read decides whether to retry.
        }
        Ok(false)
    }

    /// One CAS attempt at the timeout completion. Returns whether it landed.
    async fn try_timeout_transition(
        &self,
        version: i64,
        mut game: GameRecord,
        now: i64,
    ) -> Result<bool, ApiError> {
        let loser = game.current_turn;
        if let Some(times) = game.player_times.as_mut() {
            times.for_color_mut(loser).remaining_ms = 0;
        }
        let completion = self
            .prepare_completion(&mut game, Some(loser.opponent()), WinReason::Timeout, now)
            .await?;

        if self.store.update_game_cas(version, &game, now).await? {
            self.apply_completion_effects(completion).await;
            self.disarm_timer(game.session_id);
            log::info!("game {} timed out, {} wins", game.session_id, loser.opponent());
            self.bus
                .publish(
                    Channel::Session(game.session_id),
                    EventPayload::GameOver { game },
                )
                .await;
            return Ok(true);
        }
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Per-node clock timers
    // -----------------------------------------------------------------------

    /// Arms (or re-arms) the timer for the side to move. Harmless to call
    /// on untimed or finished games.
    fn arm_timer_for(&self, game: &GameRecord) {
        let Some(deadline) = game.deadline() else {
            return;
        };
        let Some(manager) = self.me.upgrade() else {
            return;
        };
        let session_id = game.session_id;
        let handle = tokio::spawn(async move {
            let wait = (deadline - now_ms()).max(0) as u64;
            // Slack so the timer fires after the deadline, not on it.
            tokio::time::sleep(Duration::from_millis(wait + 50)).await;
            if let Err(err) = manager.timeout(session_id).await {
                log::debug!("timer for game {} found no work: {}", session_id, err);
            }
        });
        if let Ok(mut timers) = self.timers.lock()
            && let Some(old) = timers.insert(session_id, handle)
        {
            old.abort();
        }
    }

    fn disarm_timer(&self, session_id: Uuid) {
        if let Ok(mut timers) = self.timers.lock()
            && let Some(handle) = timers.remove(&session_id)
        {
            handle.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Completion plumbing
    // -----------------------------------------------------------------------

    /// The seat of `player_id` on an active game, or the right rejection.
    fn seat_for_active(&self, game: &GameRecord, player_id: &str) -> Result<Color, ApiError> {
        match game.status {
            GameStatus::Waiting => {
                return Err(ApiError::Conflict(
                    "the game has not started yet".to_string(),
                ));
            }
            GameStatus::Complete => {
                return Err(ApiError::Conflict("game is already over".to_string()));
            }
            GameStatus::Active => {}
        }
        game.color_of(player_id)
            .ok_or_else(|| ApiError::Forbidden("you are not seated in this game".to_string()))
    }

    /// Marks the game complete and, for ranked games, computes the rating
    /// deltas inside the CAS-bounded section so the persisted record
    /// already carries `eloChanges`. The ladder and history writes are
    /// returned for application after the conditional update lands.
    async fn prepare_completion(
        &self,
        game: &mut GameRecord,
        winner: Option<Color>,
        reason: WinReason,
        now: i64,
    ) -> Result<Completion, ApiError> {
        game.status = GameStatus::Complete;
        game.completed_at = Some(now);
        game.winner = winner;
        game.win_reason = Some(reason);
        game.draw_offers.pending_from = None;

        let mut user_ratings = Vec::new();
        let mut agent_ratings = Vec::new();

        let mut white_start = game.white.as_ref().and_then(|s| s.elo_at_join);
        let mut black_start = game.black.as_ref().and_then(|s| s.elo_at_join);
        let (mut white_end, mut black_end) = (None, None);
        let (mut white_delta, mut black_delta) = (None, None);

        let ranked_pair = match (&game.white, &game.black) {
            (Some(white), Some(black)) => {
                game.is_ranked && white.user_id.is_some() && black.user_id.is_some()
            }
            _ => false,
        };

        if ranked_pair
            && let (Some(white_slot), Some(black_slot)) = (game.white.clone(), game.black.clone())
        {
            let mut white_row = self.ladder_row_for(&white_slot).await?;
            let mut black_row = self.ladder_row_for(&black_slot).await?;

            let changes = rating::compute_changes(
                white_row.elo(),
                white_row.games_played(),
                black_row.elo(),
                black_row.games_played(),
                winner,
            );
            white_start = Some(white_row.elo());
            black_start = Some(black_row.elo());
            white_end = Some(changes.white_new);
            black_end = Some(changes.black_new);
            white_delta = Some(changes.white_change);
            black_delta = Some(changes.black_change);
            game.elo_changes = Some(changes);

            let (white_outcome, black_outcome) = match winner {
                Some(Color::White) => (SideOutcome::Win, SideOutcome::Loss),
                Some(Color::Black) => (SideOutcome::Loss, SideOutcome::Win),
                None => (SideOutcome::Draw, SideOutcome::Draw),
            };
            white_row.apply(changes.white_new, white_outcome);
            black_row.apply(changes.black_new, black_outcome);

            for row in [white_row, black_row] {
                match row {
                    LadderRow::User(r) => user_ratings.push(r),
                    LadderRow::Agent(r) => agent_ratings.push(r),
                }
            }
        }

        let side = |slot: &Option<PlayerSlot>, start: Option<i32>, end: Option<i32>, delta: Option<i32>| {
            let slot = slot.as_ref();
            HistorySide {
                display_name: slot.map(|s| s.display_name.clone()).unwrap_or_default(),
                user_id: slot.and_then(|s| s.user_id.clone()),
                agent_name: slot.and_then(|s| s.agent_name.clone()),
                start_elo: start,
                end_elo: end.or(start),
                delta,
            }
        };

        let history = MatchHistoryEntry {
            session_id: game.session_id,
            white: side(&game.white, white_start, white_end, white_delta),
            black: side(&game.black, black_start, black_end, black_delta),
            winner,
            win_reason: Some(reason),
            total_moves: game.move_count,
            duration_ms: game.started_at.map(|s| now - s).unwrap_or(0),
            is_ranked: game.is_ranked,
            completed_at: now,
        };

        Ok(Completion {
            user_ratings,
            agent_ratings,
            history,
        })
    }

    /// Ladder and history writes after the CAS landed. Failures here are
    /// logged; the game record is already the source of truth.
    async fn apply_completion_effects(&self, completion: Completion) {
        for rating in &completion.user_ratings {
            if let Err(err) = self.store.upsert_user_rating(rating).await {
                log::error!("failed to update rating for {}: {}", rating.user_id, err);
            }
        }
        for rating in &completion.agent_ratings {
            if let Err(err) = self.store.upsert_agent_rating(rating).await {
                log::error!(
                    "failed to update agent rating {}/{}: {}",
                    rating.owner_user_id,
                    rating.agent_name,
                    err
                );
            }
        }
        if let Err(err) = self.store.append_match_history(&completion.history).await {
            log::error!(
                "failed to append match history for {}: {}",
                completion.history.session_id,
                err
            );
        }
    }

    /// The current ladder row for a seat: agents rate on the agent ladder
    /// keyed by (owner, agent name), humans on the user ladder.
    async fn ladder_row_for(&self, slot: &PlayerSlot) -> Result<LadderRow, ApiError> {
        match (&slot.user_id, &slot.agent_name) {
            (Some(user_id), Some(agent_name)) => Ok(LadderRow::Agent(
                self.store
                    .get_agent_rating(user_id, agent_name)
                    .await?
                    .unwrap_or(AgentRating {
                        owner_user_id: user_id.clone(),
                        agent_name: agent_name.clone(),
                        elo: DEFAULT_ELO,
                        games_played: 0,
                        wins: 0,
                        losses: 0,
                        draws: 0,
                    }),
            )),
            (Some(user_id), None) => Ok(LadderRow::User(
                self.store.get_user_rating(user_id).await?.unwrap_or(UserRating {
                    user_id: user_id.clone(),
                    display_name: slot.display_name.clone(),
                    elo: DEFAULT_ELO,
                    games_played: 0,
                    wins: 0,
                    losses: 0,
                    draws: 0,
                }),
            )),
            // Anonymous seats never rate; report the default for snapshots.
            (None, _) => Ok(LadderRow::User(UserRating {
                user_id: String::new(),
                display_name: slot.display_name.clone(),
                elo: DEFAULT_ELO,
                games_played: 0,
                wins: 0,
                losses: 0,
                draws: 0,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{connect, UserAccount};

    async fn manager() -> Arc<GameManager> {
        let pool = connect("sqlite::memory:").await.unwrap();
        let store = GameStore::new(pool);
        store.init_schema().await.unwrap();
        let bus = Arc::new(EventBus::new(store.clone(), None, Uuid::new_v4()));
        GameManager::new(store, bus, Config::default())
    }

    fn slot(player_id: &str, name: &str) -> PlayerSlot {
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

    fn user_slot(player_id: &str, name: &str, user_id: &str) -> PlayerSlot {
        PlayerSlot {
            user_id: Some(user_id.to_string()),
            ..slot(player_id, name)
        }
    }

    async fn two_player_game(manager: &Arc<GameManager>) -> GameRecord {
        let game = manager
            .create_game(slot("p1", "Alice"), None)
            .await
            .unwrap();
        manager.join(game.session_id, slot("p2", "Bob")).await.unwrap();
        manager.get_game(game.session_id).await.unwrap()
    }

    async fn play(
        manager: &Arc<GameManager>,
        session: Uuid,
        moves: &[(&str, &str, &str)],
    ) -> MoveApplied {
        let mut last = None;
        for (player, from, to) in moves {
            last = Some(
                manager
                    .make_move(session, player, from, to, None)
                    .await
                    .unwrap(),
            );
        }
        last.unwrap()
    }

    #[tokio::test]
    async fn fastest_checkmate_completes_the_game() {
        let manager = manager().await;
        let game = two_player_game(&manager).await;
        assert_eq!(game.status, GameStatus::Active);
        assert!(game.started_at.is_some());

        let applied = play(
            &manager,
            game.session_id,
            &[
                ("p1", "f2", "f3"),
                ("p2", "e7", "e5"),
                ("p1", "g2", "g4"),
                ("p2", "d8", "h4"),
            ],
        )
        .await;

        assert!(applied.checkmate);
        let game = applied.game;
        assert_eq!(game.status, GameStatus::Complete);
        assert_eq!(game.winner, Some(Color::Black));
        assert_eq!(game.win_reason, Some(WinReason::Checkmate));
        assert_eq!(game.move_count, 4);
        assert!(game.completed_at.is_some());

        // The move ledger matches the counter.
        let moves = manager.store().list_moves(game.session_id).await.unwrap();
        assert_eq!(moves.len(), 4);
        assert_eq!(moves[3].san, "Qh4#");
    }

    #[tokio::test]
    async fn join_is_idempotent_and_full_games_reject_new_tokens() {
        let manager = manager().await;
        let game = two_player_game(&manager).await;

        let rejoin = manager
            .join(game.session_id, slot("p2", "Bob"))
            .await
            .unwrap();
        assert_eq!(rejoin.color, Color::Black);
        assert!(!rejoin.newly_seated);

        let err = manager
            .join(game.session_id, slot("p3", "Mallory"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn wrong_turn_and_wrong_seat_are_rejected() {
        let manager = manager().await;
        let game = two_player_game(&manager).await;

        let err = manager
            .make_move(game.session_id, "p2", "e7", "e5", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        let err = manager
            .make_move(game.session_id, "ghost", "e2", "e4", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[tokio::test]
    async fn threefold_claim_needs_three_occurrences() {
        let manager = manager().await;
        let game = two_player_game(&manager).await;
        let session = game.session_id;

        let shuffle = [
            ("p1", "g1", "f3"),
            ("p2", "g8", "f6"),
            ("p1", "f3", "g1"),
            ("p2", "f6", "g8"),
        ];

        play(&manager, session, &shuffle).await;
        // Two occurrences of the start position so far: claiming is early.
        let err = manager
            .claim_draw(session, "p1", WinReason::ThreefoldRepetition)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        play(&manager, session, &shuffle).await;
        let game = manager
            .claim_draw(session, "p1", WinReason::ThreefoldRepetition)
            .await
            .unwrap();
        assert_eq!(game.status, GameStatus::Complete);
        assert_eq!(game.winner, None);
        assert_eq!(game.win_reason, Some(WinReason::ThreefoldRepetition));
    }

    #[tokio::test]
    async fn draw_offer_protocol() {
        let manager = manager().await;
        let game = two_player_game(&manager).await;
        let session = game.session_id;

        // Offer and decline.
        let offer = manager.offer_draw(session, "p1").await.unwrap();
        assert!(!offer.auto_declined);
        assert_eq!(offer.game.draw_offers.pending_from, Some(Color::White));
        assert_eq!(offer.game.draw_offers.white_offers_used, 1);

        // The offerer cannot respond to their own offer.
        let err = manager.respond_draw(session, "p1", true).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        let game = manager.respond_draw(session, "p2", false).await.unwrap();
        assert_eq!(game.draw_offers.pending_from, None);
        assert_eq!(game.status, GameStatus::Active);

        // A second offer while none is pending is fine; accepting ends it.
        manager.offer_draw(session, "p1").await.unwrap();
        let game = manager.respond_draw(session, "p2", true).await.unwrap();
        assert_eq!(game.status, GameStatus::Complete);
        assert_eq!(game.winner, None);
        assert_eq!(game.win_reason, Some(WinReason::Agreement));
        assert_eq!(game.draw_offers.white_offers_used, 2);
    }

    #[tokio::test]
    async fn draw_offers_are_capped_per_color() {
        let manager = manager().await;
        let game = two_player_game(&manager).await;
        let session = game.session_id;

        for _ in 0..3 {
            manager.offer_draw(session, "p1").await.unwrap();
            manager.respond_draw(session, "p2", false).await.unwrap();
        }
        let err = manager.offer_draw(session, "p1").await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        // Black still has its own budget.
        manager.offer_draw(session, "p2").await.unwrap();
    }

    #[tokio::test]
    async fn auto_decline_burns_an_offer_without_a_pending_state() {
        let manager = manager().await;
        let store = manager.store().clone();
        store
            .upsert_user(
                &UserAccount {
                    user_id: "u-bob".into(),
                    display_name: "Bob".into(),
                    api_key: None,
                    auto_decline_draws: true,
                },
                now_ms(),
            )
            .await
            .unwrap();

        let game = manager
            .create_game(slot("p1", "Alice"), None)
            .await
            .unwrap();
        manager
            .join(game.session_id, user_slot("p2", "Bob", "u-bob"))
            .await
            .unwrap();

        let offer = manager.offer_draw(game.session_id, "p1").await.unwrap();
        assert!(offer.auto_declined);
        assert_eq!(offer.game.draw_offers.pending_from, None);
        assert_eq!(offer.game.draw_offers.white_offers_used, 1);
        assert_eq!(offer.game.status, GameStatus::Active);
    }

    #[tokio::test]
    async fn timeout_transition_is_idempotent() {
        let manager = manager().await;
        let game = manager
            .create_game(
                slot("p1", "Alice"),
                Some(TimeControl::from_mode(TimeControlMode::Standard)),
            )
            .await
            .unwrap();
        manager.join(game.session_id, slot("p2", "Bob")).await.unwrap();

        // Rewind white's clock so the deadline is already past.
        let versioned = manager.store().get_game(game.session_id).await.unwrap().unwrap();
        let mut stale = versioned.game;
        if let Some(times) = stale.player_times.as_mut() {
            times.white.last_move_at = Some(now_ms() - 20 * 60_000);
        }
        assert!(manager
            .store()
            .update_game_cas(versioned.version, &stale, now_ms())
            .await
            .unwrap());

        assert!(manager.timeout(game.session_id).await.unwrap());
        let completed = manager.get_game(game.session_id).await.unwrap();
        assert_eq!(completed.status, GameStatus::Complete);
        assert_eq!(completed.winner, Some(Color::Black));
        assert_eq!(completed.win_reason, Some(WinReason::Timeout));

        // Running the transition again is a no-op.
        assert!(!manager.timeout(game.session_id).await.unwrap());
    }

    #[tokio::test]
    async fn late_move_loses_to_the_fallen_flag() {
        let manager = manager().await;
        let game = manager
            .create_game(
                slot("p1", "Alice"),
                Some(TimeControl::from_mode(TimeControlMode::Blitz)),
            )
            .await
            .unwrap();
        manager.join(game.session_id, slot("p2", "Bob")).await.unwrap();

        let versioned = manager.store().get_game(game.session_id).await.unwrap().unwrap();
        let mut stale = versioned.game;
        if let Some(times) = stale.player_times.as_mut() {
            times.white.last_move_at = Some(now_ms() - 10 * 60_000);
        }
        assert!(manager
            .store()
            .update_game_cas(versioned.version, &stale, now_ms())
            .await
            .unwrap());

        let err = manager
            .make_move(game.session_id, "p1", "e2", "e4", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        let completed = manager.get_game(game.session_id).await.unwrap();
        assert_eq!(completed.status, GameStatus::Complete);
        assert_eq!(completed.win_reason, Some(WinReason::Timeout));
        assert_eq!(completed.winner, Some(Color::Black));
    }

    #[tokio::test]
    async fn ranked_completion_updates_ladders_zero_sum() {
        let manager = manager().await;
        let store = manager.store().clone();
        for (id, name) in [("u-a", "Ann"), ("u-b", "Ben")] {
            store
                .upsert_user(
                    &UserAccount {
                        user_id: id.into(),
                        display_name: name.into(),
                        api_key: None,
                        auto_decline_draws: false,
                    },
                    now_ms(),
                )
                .await
                .unwrap();
        }

        let game = manager
            .create_matched_game(
                user_slot("c-a", "Ann", "u-a"),
                user_slot("c-b", "Ben", "u-b"),
                TimeControl::from_mode(TimeControlMode::Rapid),
                true,
            )
            .await
            .unwrap();

        let applied = play(
            &manager,
            game.session_id,
            &[
                ("c-a", "f2", "f3"),
                ("c-b", "e7", "e5"),
                ("c-a", "g2", "g4"),
                ("c-b", "d8", "h4"),
            ],
        )
        .await;

        let changes = applied.game.elo_changes.unwrap();
        assert!(changes.black_change > 0);
        assert!(changes.white_change < 0);
        assert_eq!(changes.white_change + changes.black_change, 0);

        let winner = store.get_user_rating("u-b").await.unwrap().unwrap();
        assert_eq!(winner.wins, 1);
        assert_eq!(winner.elo, changes.black_new);
        let loser = store.get_user_rating("u-a").await.unwrap().unwrap();
        assert_eq!(loser.losses, 1);

        let history = store.list_user_games("u-a", 1, 10, false).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].winner, Some(Color::Black));
        assert_eq!(history[0].total_moves, 4);
    }

    #[tokio::test]
    async fn ranked_seats_refuse_anonymous_joins() {
        let manager = manager().await;
        // A ranked game with an open seat (built directly; the public
        // paths only produce ranked games fully seated).
        let initial = Position::starting();
        let game = GameRecord::new(
            Uuid::new_v4(),
            Some(user_slot("c-a", "Ann", "u-a")),
            Some(TimeControl::from_mode(TimeControlMode::Rapid)),
            true,
            GameType::Matchmaking,
            initial.to_fen(),
            initial.position_key(),
            now_ms(),
        );
        manager.store().create_game(&game).await.unwrap();

        let err = manager
            .join(game.session_id, slot("anon", "Ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));

        // An authenticated join is seated and the game starts.
        let joined = manager
            .join(game.session_id, user_slot("c-b", "Ben", "u-b"))
            .await
            .unwrap();
        assert_eq!(joined.color, Color::Black);
        assert_eq!(joined.game.status, GameStatus::Active);
    }

    #[tokio::test]
    async fn resignation_completes_with_opponent_winning() {
        let manager = manager().await;
        let game = two_player_game(&manager).await;
        let completed = manager.resign(game.session_id, "p2").await.unwrap();
        assert_eq!(completed.status, GameStatus::Complete);
        assert_eq!(completed.winner, Some(Color::White));
        assert_eq!(completed.win_reason, Some(WinReason::Resignation));
    }

    #[tokio::test]
    async fn snapshot_reports_claim_flags() {
        let manager = manager().await;
        let game = two_player_game(&manager).await;
        let snapshot = manager.snapshot(&game);
        assert!(!snapshot.can_claim_threefold);
        assert!(!snapshot.can_claim_fifty_moves);
        assert!(snapshot.server_time > 0);

        let shuffle = [
            ("p1", "g1", "f3"),
            ("p2", "g8", "f6"),
            ("p1", "f3", "g1"),
            ("p2", "f6", "g8"),
        ];
        play(&manager, game.session_id, &shuffle).await;
        let applied = play(&manager, game.session_id, &shuffle).await;
        let snapshot = manager.snapshot(&applied.game);
        assert!(snapshot.can_claim_threefold);
    }
}
