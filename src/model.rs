//! Server-side data model.
//!
//! Everything the store persists and the wire exposes: game records with
//! player slots, clocks and the draw-offer ledger, move rows, match
//! history, the two rating ladders, matchmaking queue entries, and the
//! cross-node event envelope. Chess values live in [`crate::types`]; this
//! module is about the session layer around them.

use crate::types::Color;
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

/// Milliseconds since the Unix epoch — every timestamp on the wire.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Starting rating for players and agents that have never completed a
/// ranked game.
pub const DEFAULT_ELO: i32 = 1200;

/// Draw offers allowed per color per game.
pub const MAX_DRAW_OFFERS: u8 = 3;

// ---------------------------------------------------------------------------
// Game lifecycle enums
// ---------------------------------------------------------------------------

/// The lifecycle state of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Waiting,
    Active,
    Complete,
}

/// How the game came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum GameType {
    Casual,
    Matchmaking,
}

/// Why a completed game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WinReason {
    Checkmate,
    Stalemate,
    InsufficientMaterial,
    Timeout,
    Resignation,
    Agreement,
    ThreefoldRepetition,
    FiftyMoves,
}

impl fmt::Display for WinReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WinReason::Checkmate => "checkmate",
            WinReason::Stalemate => "stalemate",
            WinReason::InsufficientMaterial => "insufficient_material",
            WinReason::Timeout => "timeout",
            WinReason::Resignation => "resignation",
            WinReason::Agreement => "agreement",
            WinReason::ThreefoldRepetition => "threefold_repetition",
            WinReason::FiftyMoves => "fifty_moves",
        };
        write!(f, "{}", s)
    }
}

// ---------------------------------------------------------------------------
// Time control
// ---------------------------------------------------------------------------

/// Named time-control modes. Matchmaking intersects the sets of modes two
/// entries accept and picks the lexicographically smallest common one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum TimeControlMode {
    Blitz,
    Rapid,
    Standard,
    Unlimited,
}

impl TimeControlMode {
    /// Base clock and per-move increment in milliseconds.
    pub fn base_and_increment(self) -> (i64, i64) {
        match self {
            TimeControlMode::Blitz => (5 * 60_000, 3_000),
            TimeControlMode::Rapid => (10 * 60_000, 5_000),
            TimeControlMode::Standard => (15 * 60_000, 10_000),
            TimeControlMode::Unlimited => (0, 0),
        }
    }

    /// The wire name, which is also the ordering key for matchmaking.
    pub fn as_str(self) -> &'static str {
        match self {
            TimeControlMode::Blitz => "blitz",
            TimeControlMode::Rapid => "rapid",
            TimeControlMode::Standard => "standard",
            TimeControlMode::Unlimited => "unlimited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blitz" => Some(TimeControlMode::Blitz),
            "rapid" => Some(TimeControlMode::Rapid),
            "standard" => Some(TimeControlMode::Standard),
            "unlimited" => Some(TimeControlMode::Unlimited),
            _ => None,
        }
    }
}

impl fmt::Display for TimeControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A concrete time control on a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeControl {
    pub mode: TimeControlMode,
    pub base_ms: i64,
    pub increment_ms: i64,
}

impl TimeControl {
    pub fn from_mode(mode: TimeControlMode) -> Self {
        let (base_ms, increment_ms) = mode.base_and_increment();
        Self {
            mode,
            base_ms,
            increment_ms,
        }
    }

    /// Unlimited games have no clock and never time out.
    pub fn is_unlimited(&self) -> bool {
        self.mode == TimeControlMode::Unlimited
    }
}

// ---------------------------------------------------------------------------
// Player slots & clocks
// ---------------------------------------------------------------------------

/// A seat at the board. The `player_id` is the per-seat token issued at
/// join time — deliberately distinct from the user identifier so anonymous
/// seats and matchmaking connection ids work as tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSlot {
    pub player_id: String,
    pub display_name: String,
    pub user_id: Option<String>,
    pub agent_name: Option<String>,
    pub engine_name: Option<String>,
    /// Rating snapshot taken when the seat was filled; match history uses
    /// it as the starting Elo.
    pub elo_at_join: Option<i32>,
    pub client_software: Option<String>,
}

/// The draw-offer ledger for a game.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DrawOffers {
    pub white_offers_used: u8,
    pub black_offers_used: u8,
    /// Set while an offer awaits a response; only ever set on active games.
    pub pending_from: Option<Color>,
}

impl DrawOffers {
    pub fn used_by(&self, color: Color) -> u8 {
        match color {
            Color::White => self.white_offers_used,
            Color::Black => self.black_offers_used,
        }
    }

    pub fn used_by_mut(&mut self, color: Color) -> &mut u8 {
        match color {
            Color::White => &mut self.white_offers_used,
            Color::Black => &mut self.black_offers_used,
        }
    }
}

/// One side's clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlayerClock {
    pub remaining_ms: i64,
    /// Server time when this side most recently became the side to move.
    pub last_move_at: Option<i64>,
}

/// Both clocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlayerTimes {
    pub white: PlayerClock,
    pub black: PlayerClock,
}

impl PlayerTimes {
    pub fn for_color(&self, color: Color) -> &PlayerClock {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }

    pub fn for_color_mut(&mut self, color: Color) -> &mut PlayerClock {
        match color {
            Color::White => &mut self.white,
            Color::Black => &mut self.black,
        }
    }
}

/// Rating deltas recorded on a ranked completion. Deltas are zero-sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EloChanges {
    pub white_change: i32,
    pub black_change: i32,
    pub white_new: i32,
    pub black_new: i32,
}

// ---------------------------------------------------------------------------
// The game record
// ---------------------------------------------------------------------------

/// The persistent record of one game. This is the document the store keeps
/// under the session id, guarded by a monotonically increasing `version`
/// for conditional updates.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    pub session_id: Uuid,
    pub status: GameStatus,
    pub game_type: GameType,
    pub is_ranked: bool,
    pub white: Option<PlayerSlot>,
    pub black: Option<PlayerSlot>,
    /// Always equals the FEN's active color.
    pub current_turn: Color,
    /// Canonical position, six-field FEN.
    pub fen: String,
    /// Position keys in play order for threefold detection; the current
    /// position is the last element. Bounded by the configured maximum.
    pub position_history: Vec<String>,
    pub move_count: u32,
    pub draw_offers: DrawOffers,
    pub time_control: Option<TimeControl>,
    pub player_times: Option<PlayerTimes>,
    pub winner: Option<Color>,
    pub win_reason: Option<WinReason>,
    pub elo_changes: Option<EloChanges>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl GameRecord {
    /// A fresh game with the creator (if any) seated as white.
    pub fn new(
        session_id: Uuid,
        creator: Option<PlayerSlot>,
        time_control: Option<TimeControl>,
        is_ranked: bool,
        game_type: GameType,
        initial_fen: String,
        initial_key: String,
        now: i64,
    ) -> Self {
        Self {
            session_id,
            status: GameStatus::Waiting,
            game_type,
            is_ranked,
            white: creator,
            black: None,
            current_turn: Color::White,
            fen: initial_fen,
            position_history: vec![initial_key],
            move_count: 0,
            draw_offers: DrawOffers::default(),
            time_control,
            player_times: None,
            winner: None,
            win_reason: None,
            elo_changes: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn slot(&self, color: Color) -> &Option<PlayerSlot> {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }

    pub fn slot_mut(&mut self, color: Color) -> &mut Option<PlayerSlot> {
        match color {
            Color::White => &mut self.white,
            Color::Black => &mut self.black,
        }
    }

    /// The color a player token is seated at, if any.
    pub fn color_of(&self, player_id: &str) -> Option<Color> {
        if self.white.as_ref().is_some_and(|s| s.player_id == player_id) {
            return Some(Color::White);
        }
        if self.black.as_ref().is_some_and(|s| s.player_id == player_id) {
            return Some(Color::Black);
        }
        None
    }

    pub fn seated(&self) -> usize {
        self.white.is_some() as usize + self.black.is_some() as usize
    }

    /// Appends a position key, dropping the oldest beyond `max`.
    pub fn push_position_key(&mut self, key: String, max: usize) {
        self.position_history.push(key);
        while self.position_history.len() > max {
            self.position_history.remove(0);
        }
    }

    /// Occurrences of the current position in the recorded history.
    pub fn current_position_repetitions(&self) -> usize {
        match self.position_history.last() {
            Some(current) => self
                .position_history
                .iter()
                .filter(|k| *k == current)
                .count(),
            None => 0,
        }
    }

    /// When the side to move runs out of clock, if the game is timed and
    /// running.
    pub fn deadline(&self) -> Option<i64> {
        if self.status != GameStatus::Active {
            return None;
        }
        let tc = self.time_control?;
        if tc.is_unlimited() {
            return None;
        }
        let clock = self.player_times?.for_color(self.current_turn).to_owned();
        Some(clock.last_move_at? + clock.remaining_ms)
    }
}

// ---------------------------------------------------------------------------
// Moves & match history
// ---------------------------------------------------------------------------

/// One applied move, append-only per game.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MoveRow {
    pub session_id: Uuid,
    /// 1-based ply number.
    pub move_number: u32,
    pub player_id: String,
    pub from: String,
    pub to: String,
    /// Uppercase piece letter ("K", "Q", …, "P").
    pub piece: String,
    pub san: String,
    pub capture: bool,
    pub check: bool,
    pub checkmate: bool,
    pub promotion: Option<String>,
}

/// One side of a completed game as match history shows it. Names and Elo
/// are duplicated from the slot on purpose: ratings move after the fact,
/// history shows the game as it was played.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistorySide {
    pub display_name: String,
    pub user_id: Option<String>,
    pub agent_name: Option<String>,
    pub start_elo: Option<i32>,
    pub end_elo: Option<i32>,
    pub delta: Option<i32>,
}

/// Emitted once per completed game.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchHistoryEntry {
    pub session_id: Uuid,
    pub white: HistorySide,
    pub black: HistorySide,
    pub winner: Option<Color>,
    pub win_reason: Option<WinReason>,
    pub total_moves: u32,
    pub duration_ms: i64,
    pub is_ranked: bool,
    pub completed_at: i64,
}

// ---------------------------------------------------------------------------
// Rating ladders
// ---------------------------------------------------------------------------

/// Human ladder row, keyed by user id.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserRating {
    pub user_id: String,
    pub display_name: String,
    pub elo: i32,
    pub games_played: i32,
    pub wins: i32,
    pub losses: i32,
    pub draws: i32,
}

/// Agent ladder row, keyed by (owner user id, agent name).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentRating {
    pub owner_user_id: String,
    pub agent_name: String,
    pub elo: i32,
    pub games_played: i32,
    pub wins: i32,
    pub losses: i32,
    pub draws: i32,
}

// ---------------------------------------------------------------------------
// Matchmaking queue
// ---------------------------------------------------------------------------

/// What kind of opponent a queue entry accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OpponentType {
    Human,
    Ai,
    Either,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Waiting,
    Matched,
    Expired,
}

/// A waiting-to-be-matched intent, keyed by the client-supplied connection
/// id. The connection id doubles as the player token when a game is
/// created from the queue.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub connection_id: String,
    pub user_id: Option<String>,
    pub display_name: String,
    pub agent_name: Option<String>,
    pub engine_name: Option<String>,
    pub is_ranked: bool,
    pub preferred_color: Option<Color>,
    pub opponent_type: OpponentType,
    /// Accepted time-control modes; never empty.
    pub time_controls: Vec<TimeControlMode>,
    /// Rating snapshot at join.
    pub elo: i32,
    pub joined_at: i64,
    pub expires_at: i64,
    pub status: QueueStatus,
    pub matched_session_id: Option<Uuid>,
}

impl QueueEntry {
    /// Entries carrying an agent name queue as agents.
    pub fn is_agent(&self) -> bool {
        self.agent_name.is_some()
    }
}

/// The lobby projection of a queue entry, with private fields omitted.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LobbyEntry {
    pub display_name: String,
    pub agent_name: Option<String>,
    pub is_ranked: bool,
    pub opponent_type: OpponentType,
    pub time_controls: Vec<TimeControlMode>,
    pub elo: i32,
    pub joined_at: i64,
}

impl From<&QueueEntry> for LobbyEntry {
    fn from(entry: &QueueEntry) -> Self {
        Self {
            display_name: entry.display_name.clone(),
            agent_name: entry.agent_name.clone(),
            is_ranked: entry.is_ranked,
            opponent_type: entry.opponent_type,
            time_controls: entry.time_controls.clone(),
            elo: entry.elo,
            joined_at: entry.joined_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Cross-node event envelope
// ---------------------------------------------------------------------------

/// A logical delivery channel for push events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    /// All subscribers of one game session.
    Session(Uuid),
    /// The pending matchmaking push channel of one connection id.
    Match(String),
    /// Every lobby subscriber.
    Lobby,
}

impl Channel {
    pub fn parse(s: &str) -> Option<Channel> {
        if s == "lobby" {
            return Some(Channel::Lobby);
        }
        if let Some(id) = s.strip_prefix("session:") {
            return Uuid::parse_str(id).ok().map(Channel::Session);
        }
        s.strip_prefix("match:")
            .map(|conn| Channel::Match(conn.to_string()))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Session(id) => write!(f, "session:{}", id),
            Channel::Match(conn) => write!(f, "match:{}", conn),
            Channel::Lobby => write!(f, "lobby"),
        }
    }
}

/// The typed payload of a push frame / cross-node envelope. Dispatch is a
/// flat match on the tag; nodes skip tags they do not recognize, which
/// keeps the log forward-compatible.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    GameUpdate {
        game: GameRecord,
    },
    Move {
        game: GameRecord,
        #[serde(rename = "move")]
        mv: MoveRow,
    },
    PlayerJoined {
        game: GameRecord,
        color: Color,
    },
    Resignation {
        game: GameRecord,
        by: Color,
    },
    GameOver {
        game: GameRecord,
    },
    DrawOffered {
        game: GameRecord,
        by: Color,
    },
    DrawDeclined {
        game: GameRecord,
        auto_declined: bool,
    },
    TimeUpdate {
        game: GameRecord,
    },
    MatchFound {
        session_id: Uuid,
    },
    LobbyUpdate {
        entries: Vec<LobbyEntry>,
    },
}

/// A row of the append-only cross-node event log. The log id is the
/// monotonic sequence and the tail cursor.
#[derive(Debug, Clone)]
pub struct WsEventRow {
    pub id: i64,
    pub channel: String,
    pub payload: serde_json::Value,
    pub origin_node: Uuid,
    pub created_at: i64,
}
