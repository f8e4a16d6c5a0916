//! The persistent store shared by every server node.
//!
//! Games, moves, users, the two rating ladders, match history, the
//! matchmaking queue and the cross-node event log all live here. The game
//! record is kept as a JSON document beside a monotonically increasing
//! `version` column; every game mutation goes through the conditional
//! update [`GameStore::update_game_cas`], which is the serialization point
//! that lets concurrent moves on one session linearize across nodes.
//!
//! Queries are runtime `sqlx::query` with binds; the schema is created at
//! startup with `CREATE TABLE IF NOT EXISTS`.

use crate::model::*;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A game record together with the version the read observed. The version
/// must be handed back to [`GameStore::update_game_cas`] unchanged.
#[derive(Debug, Clone)]
pub struct VersionedGame {
    pub game: GameRecord,
    pub version: i64,
}

/// A user account row. Account issuance (passwords, OAuth) lives in the
/// identity service; the server only reads these rows to resolve API keys
/// and preferences, plus one row it creates itself for the builtin agent.
#[derive(Debug, Clone)]
pub struct UserAccount {
    pub user_id: String,
    pub display_name: String,
    pub api_key: Option<String>,
    pub auto_decline_draws: bool,
}

/// Which ladder a leaderboard query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderKind {
    Players,
    Agents,
}

/// Opens the shared database, creating the file if needed.
pub async fn connect(database_url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(StoreError::Db)?
        .create_if_missing(true);

    // An in-memory database exists per connection; keep the pool at one
    // so every handle sees the same data.
    let max = if database_url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max)
        .connect_with(options)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct GameStore {
    pool: SqlitePool,
}

impl GameStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates every table the server needs. Idempotent.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS games (
                session_id TEXT PRIMARY KEY,
                doc TEXT NOT NULL,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                game_type TEXT NOT NULL,
                is_ranked INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_games_status ON games(status, updated_at)",
            "CREATE TABLE IF NOT EXISTS moves (
                session_id TEXT NOT NULL,
                move_number INTEGER NOT NULL,
                player_id TEXT NOT NULL,
                from_sq TEXT NOT NULL,
                to_sq TEXT NOT NULL,
                piece TEXT NOT NULL,
                san TEXT NOT NULL,
                capture INTEGER NOT NULL,
                check_flag INTEGER NOT NULL,
                checkmate INTEGER NOT NULL,
                promotion TEXT,
                PRIMARY KEY (session_id, move_number)
            )",
            "CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                api_key TEXT UNIQUE,
                auto_decline_draws INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS user_ratings (
                user_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                elo INTEGER NOT NULL,
                games_played INTEGER NOT NULL,
                wins INTEGER NOT NULL,
                losses INTEGER NOT NULL,
                draws INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS agent_ratings (
                owner_user_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                elo INTEGER NOT NULL,
                games_played INTEGER NOT NULL,
                wins INTEGER NOT NULL,
                losses INTEGER NOT NULL,
                draws INTEGER NOT NULL,
                PRIMARY KEY (owner_user_id, agent_name)
            )",
            "CREATE TABLE IF NOT EXISTS match_history (
                session_id TEXT PRIMARY KEY,
                doc TEXT NOT NULL,
                white_user_id TEXT,
                black_user_id TEXT,
                is_ranked INTEGER NOT NULL,
                completed_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS queue (
                connection_id TEXT PRIMARY KEY,
                doc TEXT NOT NULL,
                status TEXT NOT NULL,
                joined_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS ws_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                payload TEXT NOT NULL,
                origin_node TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Games
    // -----------------------------------------------------------------------

    fn status_str(status: GameStatus) -> &'static str {
        match status {
            GameStatus::Waiting => "waiting",
            GameStatus::Active => "active",
            GameStatus::Complete => "complete",
        }
    }

    fn game_type_str(game_type: GameType) -> &'static str {
        match game_type {
            GameType::Casual => "casual",
            GameType::Matchmaking => "matchmaking",
        }
    }

    /// Inserts a new game at version 1.
    pub async fn create_game(&self, game: &GameRecord) -> Result<(), StoreError> {
        let doc = serde_json::to_string(game)?;
        sqlx::query(
            "INSERT INTO games (session_id, doc, version, status, game_type, is_ranked, created_at, updated_at)
             VALUES ($1, $2, 1, $3, $4, $5, $6, $6)",
        )
        .bind(game.session_id.to_string())
        .bind(doc)
        .bind(Self::status_str(game.status))
        .bind(Self::game_type_str(game.game_type))
        .bind(game.is_ranked)
        .bind(game.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_game(&self, session_id: Uuid) -> Result<Option<VersionedGame>, StoreError> {
        let row = sqlx::query("SELECT doc, version FROM games WHERE session_id = $1")
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let doc: String = row.get("doc");
                let version: i64 = row.get("version");
                Ok(Some(VersionedGame {
                    game: serde_json::from_str(&doc)?,
                    version,
                }))
            }
            None => Ok(None),
        }
    }

    /// Conditionally replaces a game document. Succeeds only if the stored
    /// version still equals `expected_version`; on success the version is
    /// bumped by one. Returns `false` when another writer got there first.
    pub async fn update_game_cas(
        &self,
        expected_version: i64,
        game: &GameRecord,
        now: i64,
    ) -> Result<bool, StoreError> {
        let doc = serde_json::to_string(game)?;
        let result = sqlx::query(
            "UPDATE games SET doc = $1, version = version + 1, status = $2, updated_at = $3
             WHERE session_id = $4 AND version = $5",
        )
        .bind(doc)
        .bind(Self::status_str(game.status))
        .bind(now)
        .bind(game.session_id.to_string())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Active games, most recently touched first. `inactive_mins` drops
    /// games with no activity in the last that-many minutes, so stale
    /// boards stay out of spectate listings.
    pub async fn list_active_games(
        &self,
        limit: i64,
        inactive_mins: Option<i64>,
        ranked: Option<bool>,
        now: i64,
    ) -> Result<Vec<GameRecord>, StoreError> {
        let cutoff = inactive_mins.map(|m| now - m * 60_000).unwrap_or(0);
        let rows = sqlx::query(
            "SELECT doc FROM games
             WHERE status = 'active'
               AND updated_at >= $1
               AND ($2 IS NULL OR is_ranked = $2)
             ORDER BY updated_at DESC LIMIT $3",
        )
        .bind(cutoff)
        .bind(ranked)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| Ok(serde_json::from_str(&row.get::<String, _>("doc"))?))
            .collect()
    }

    pub async fn list_completed_games(
        &self,
        limit: i64,
        ranked: Option<bool>,
    ) -> Result<Vec<GameRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc FROM games
             WHERE status = 'complete' AND ($1 IS NULL OR is_ranked = $1)
             ORDER BY updated_at DESC LIMIT $2",
        )
        .bind(ranked)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| Ok(serde_json::from_str(&row.get::<String, _>("doc"))?))
            .collect()
    }

    /// Every active game with a running clock — the sweeper's scan set.
    pub async fn list_active_timed_games(&self) -> Result<Vec<GameRecord>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM games WHERE status = 'active'")
            .fetch_all(&self.pool)
            .await?;
        let mut games = Vec::new();
        for row in rows {
            let game: GameRecord = serde_json::from_str(&row.get::<String, _>("doc"))?;
            if game
                .time_control
                .is_some_and(|tc| !tc.is_unlimited())
            {
                games.push(game);
            }
        }
        Ok(games)
    }

    // -----------------------------------------------------------------------
    // Moves
    // -----------------------------------------------------------------------

    pub async fn append_move(&self, mv: &MoveRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO moves (session_id, move_number, player_id, from_sq, to_sq, piece, san,
                                capture, check_flag, checkmate, promotion)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(mv.session_id.to_string())
        .bind(mv.move_number)
        .bind(&mv.player_id)
        .bind(&mv.from)
        .bind(&mv.to)
        .bind(&mv.piece)
        .bind(&mv.san)
        .bind(mv.capture)
        .bind(mv.check)
        .bind(mv.checkmate)
        .bind(&mv.promotion)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_moves(&self, session_id: Uuid) -> Result<Vec<MoveRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT move_number, player_id, from_sq, to_sq, piece, san, capture, check_flag,
                    checkmate, promotion
             FROM moves WHERE session_id = $1 ORDER BY move_number",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| MoveRow {
                session_id,
                move_number: row.get::<i64, _>("move_number") as u32,
                player_id: row.get("player_id"),
                from: row.get("from_sq"),
                to: row.get("to_sq"),
                piece: row.get("piece"),
                san: row.get("san"),
                capture: row.get("capture"),
                check: row.get("check_flag"),
                checkmate: row.get("checkmate"),
                promotion: row.get("promotion"),
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> UserAccount {
        UserAccount {
            user_id: row.get("user_id"),
            display_name: row.get("display_name"),
            api_key: row.get("api_key"),
            auto_decline_draws: row.get("auto_decline_draws"),
        }
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<UserAccount>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, display_name, api_key, auto_decline_draws FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::user_from_row))
    }

    pub async fn get_user_by_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<UserAccount>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, display_name, api_key, auto_decline_draws FROM users WHERE api_key = $1",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::user_from_row))
    }

    pub async fn upsert_user(&self, user: &UserAccount, now: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (user_id, display_name, api_key, auto_decline_draws, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT(user_id) DO UPDATE SET
                display_name = excluded.display_name,
                api_key = excluded.api_key,
                auto_decline_draws = excluded.auto_decline_draws",
        )
        .bind(&user.user_id)
        .bind(&user.display_name)
        .bind(&user.api_key)
        .bind(user.auto_decline_draws)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_user_by_display_name(
        &self,
        display_name: &str,
    ) -> Result<Option<UserAccount>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, display_name, api_key, auto_decline_draws FROM users
             WHERE display_name = $1",
        )
        .bind(display_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::user_from_row))
    }

    // -----------------------------------------------------------------------
    // Ratings
    // -----------------------------------------------------------------------

    pub async fn get_user_rating(&self, user_id: &str) -> Result<Option<UserRating>, StoreError> {
        let row = sqlx::query("SELECT * FROM user_ratings WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| UserRating {
            user_id: row.get("user_id"),
            display_name: row.get("display_name"),
            elo: row.get("elo"),
            games_played: row.get("games_played"),
            wins: row.get("wins"),
            losses: row.get("losses"),
            draws: row.get("draws"),
        }))
    }

    pub async fn upsert_user_rating(&self, rating: &UserRating) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_ratings (user_id, display_name, elo, games_played, wins, losses, draws)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT(user_id) DO UPDATE SET
                display_name = excluded.display_name,
                elo = excluded.elo,
                games_played = excluded.games_played,
                wins = excluded.wins,
                losses = excluded.losses,
                draws = excluded.draws",
        )
        .bind(&rating.user_id)
        .bind(&rating.display_name)
        .bind(rating.elo)
        .bind(rating.games_played)
        .bind(rating.wins)
        .bind(rating.losses)
        .bind(rating.draws)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_agent_rating(
        &self,
        owner_user_id: &str,
        agent_name: &str,
    ) -> Result<Option<AgentRating>, StoreError> {
        let row =
            sqlx::query("SELECT * FROM agent_ratings WHERE owner_user_id = $1 AND agent_name = $2")
                .bind(owner_user_id)
                .bind(agent_name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|row| AgentRating {
            owner_user_id: row.get("owner_user_id"),
            agent_name: row.get("agent_name"),
            elo: row.get("elo"),
            games_played: row.get("games_played"),
            wins: row.get("wins"),
            losses: row.get("losses"),
            draws: row.get("draws"),
        }))
    }

    pub async fn upsert_agent_rating(&self, rating: &AgentRating) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO agent_ratings (owner_user_id, agent_name, elo, games_played, wins, losses, draws)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT(owner_user_id, agent_name) DO UPDATE SET
                elo = excluded.elo,
                games_played = excluded.games_played,
                wins = excluded.wins,
                losses = excluded.losses,
                draws = excluded.draws",
        )
        .bind(&rating.owner_user_id)
        .bind(&rating.agent_name)
        .bind(rating.elo)
        .bind(rating.games_played)
        .bind(rating.wins)
        .bind(rating.losses)
        .bind(rating.draws)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Top ladder rows by Elo. The player ladder returns user ratings; the
    /// agent ladder returns agent ratings as (owner, name) pairs.
    pub async fn leaderboard(
        &self,
        kind: LadderKind,
        limit: i64,
    ) -> Result<serde_json::Value, StoreError> {
        match kind {
            LadderKind::Players => {
                let rows =
                    sqlx::query("SELECT * FROM user_ratings ORDER BY elo DESC LIMIT $1")
                        .bind(limit)
                        .fetch_all(&self.pool)
                        .await?;
                let entries: Vec<UserRating> = rows
                    .into_iter()
                    .map(|row| UserRating {
                        user_id: row.get("user_id"),
                        display_name: row.get("display_name"),
                        elo: row.get("elo"),
                        games_played: row.get("games_played"),
                        wins: row.get("wins"),
                        losses: row.get("losses"),
                        draws: row.get("draws"),
                    })
                    .collect();
                Ok(serde_json::to_value(entries)?)
            }
            LadderKind::Agents => {
                let rows =
                    sqlx::query("SELECT * FROM agent_ratings ORDER BY elo DESC LIMIT $1")
                        .bind(limit)
                        .fetch_all(&self.pool)
                        .await?;
                let entries: Vec<AgentRating> = rows
                    .into_iter()
                    .map(|row| AgentRating {
                        owner_user_id: row.get("owner_user_id"),
                        agent_name: row.get("agent_name"),
                        elo: row.get("elo"),
                        games_played: row.get("games_played"),
                        wins: row.get("wins"),
                        losses: row.get("losses"),
                        draws: row.get("draws"),
                    })
                    .collect();
                Ok(serde_json::to_value(entries)?)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Match history
    // -----------------------------------------------------------------------

    pub async fn append_match_history(
        &self,
        entry: &MatchHistoryEntry,
    ) -> Result<(), StoreError> {
        let doc = serde_json::to_string(entry)?;
        sqlx::query(
            "INSERT OR REPLACE INTO match_history
                (session_id, doc, white_user_id, black_user_id, is_ranked, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.session_id.to_string())
        .bind(doc)
        .bind(&entry.white.user_id)
        .bind(&entry.black.user_id)
        .bind(entry.is_ranked)
        .bind(entry.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A user's completed games, newest first. Set `ranked_only` to hide
    /// unranked rows (the listing for everyone but the owner).
    pub async fn list_user_games(
        &self,
        user_id: &str,
        page: i64,
        limit: i64,
        ranked_only: bool,
    ) -> Result<Vec<MatchHistoryEntry>, StoreError> {
        let offset = (page.max(1) - 1) * limit;
        let rows = sqlx::query(
            "SELECT doc FROM match_history
             WHERE (white_user_id = $1 OR black_user_id = $1)
               AND ($2 = 0 OR is_ranked = 1)
             ORDER BY completed_at DESC LIMIT $3 OFFSET $4",
        )
        .bind(user_id)
        .bind(ranked_only)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| Ok(serde_json::from_str(&row.get::<String, _>("doc"))?))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Matchmaking queue
    // -----------------------------------------------------------------------

    pub async fn join_queue(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        let doc = serde_json::to_string(entry)?;
        sqlx::query(
            "INSERT OR REPLACE INTO queue (connection_id, doc, status, joined_at, expires_at)
             VALUES ($1, $2, 'waiting', $3, $4)",
        )
        .bind(&entry.connection_id)
        .bind(doc)
        .bind(entry.joined_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes an entry outright. Returns whether anything was removed.
    pub async fn leave_queue(&self, connection_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM queue WHERE connection_id = $1")
            .bind(connection_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_queue_entry(
        &self,
        connection_id: &str,
    ) -> Result<Option<QueueEntry>, StoreError> {
        let row = sqlx::query("SELECT doc FROM queue WHERE connection_id = $1")
            .bind(connection_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row.get::<String, _>("doc"))?)),
            None => Ok(None),
        }
    }

    /// Waiting entries in join order, skipping expired ones.
    pub async fn list_waiting_queue(&self, now: i64) -> Result<Vec<QueueEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc FROM queue WHERE status = 'waiting' AND expires_at > $1
             ORDER BY joined_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| Ok(serde_json::from_str(&row.get::<String, _>("doc"))?))
            .collect()
    }

    pub async fn mark_queue_matched(
        &self,
        connection_id: &str,
        session_id: Uuid,
    ) -> Result<(), StoreError> {
        if let Some(mut entry) = self.get_queue_entry(connection_id).await? {
            entry.status = QueueStatus::Matched;
            entry.matched_session_id = Some(session_id);
            let doc = serde_json::to_string(&entry)?;
            sqlx::query("UPDATE queue SET doc = $1, status = 'matched' WHERE connection_id = $2")
                .bind(doc)
                .bind(connection_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Marks every overdue waiting entry expired. Returns how many changed.
    pub async fn expire_queue(&self, now: i64) -> Result<u64, StoreError> {
        let rows = sqlx::query(
            "SELECT connection_id, doc FROM queue WHERE status = 'waiting' AND expires_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        let count = rows.len() as u64;
        for row in rows {
            let mut entry: QueueEntry = serde_json::from_str(&row.get::<String, _>("doc"))?;
            entry.status = QueueStatus::Expired;
            let doc = serde_json::to_string(&entry)?;
            sqlx::query("UPDATE queue SET doc = $1, status = 'expired' WHERE connection_id = $2")
                .bind(doc)
                .bind(row.get::<String, _>("connection_id"))
                .execute(&self.pool)
                .await?;
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Cross-node event log
    // -----------------------------------------------------------------------

    /// Appends an envelope and returns its log id (the monotonic sequence).
    pub async fn append_ws_event(
        &self,
        channel: &str,
        payload: &serde_json::Value,
        origin_node: Uuid,
        now: i64,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO ws_events (channel, payload, origin_node, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(channel)
        .bind(payload.to_string())
        .bind(origin_node.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Envelopes after `cursor`, oldest first, bounded by `limit`.
    pub async fn read_ws_events_since(
        &self,
        cursor: i64,
        limit: i64,
    ) -> Result<Vec<WsEventRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, channel, payload, origin_node, created_at FROM ws_events
             WHERE id > $1 ORDER BY id LIMIT $2",
        )
        .bind(cursor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("payload");
            let origin: String = row.get("origin_node");
            events.push(WsEventRow {
                id: row.get("id"),
                channel: row.get("channel"),
                payload: serde_json::from_str(&payload)?,
                origin_node: Uuid::parse_str(&origin).unwrap_or_default(),
                created_at: row.get("created_at"),
            });
        }
        Ok(events)
    }

    /// The current tail of the log; a fresh node starts its cursor here.
    pub async fn latest_ws_event_id(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS id FROM ws_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("id"))
    }

    /// Drops envelopes older than the retention horizon.
    pub async fn purge_ws_events_before(&self, cutoff: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM ws_events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Color;

    async fn test_store() -> GameStore {
        let pool = connect("sqlite::memory:").await.unwrap();
        let store = GameStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn sample_game() -> GameRecord {
        GameRecord::new(
            Uuid::new_v4(),
            Some(PlayerSlot {
                player_id: "p1".into(),
                display_name: "Alice".into(),
                user_id: None,
                agent_name: None,
                engine_name: None,
                elo_at_join: None,
                client_software: None,
            }),
            None,
            false,
            GameType::Casual,
            crate::types::Position::starting().to_fen(),
            crate::types::Position::starting().position_key(),
            now_ms(),
        )
    }

    #[tokio::test]
    async fn game_round_trip_and_cas() {
        let store = test_store().await;
        let game = sample_game();
        store.create_game(&game).await.unwrap();

        let loaded = store.get_game(game.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.game.session_id, game.session_id);
        assert_eq!(loaded.game.status, GameStatus::Waiting);

        // First writer wins, second (stale version) loses.
        let mut updated = loaded.game.clone();
        updated.move_count = 1;
        assert!(store.update_game_cas(1, &updated, now_ms()).await.unwrap());
        assert!(!store.update_game_cas(1, &updated, now_ms()).await.unwrap());

        let reloaded = store.get_game(game.session_id).await.unwrap().unwrap();
        assert_eq!(reloaded.version, 2);
        assert_eq!(reloaded.game.move_count, 1);
    }

    #[tokio::test]
    async fn moves_append_and_list_in_order() {
        let store = test_store().await;
        let game = sample_game();
        store.create_game(&game).await.unwrap();

        for (n, san) in [(1u32, "e4"), (2, "e5"), (3, "Nf3")] {
            store
                .append_move(&MoveRow {
                    session_id: game.session_id,
                    move_number: n,
                    player_id: "p1".into(),
                    from: "e2".into(),
                    to: "e4".into(),
                    piece: "P".into(),
                    san: san.into(),
                    capture: false,
                    check: false,
                    checkmate: false,
                    promotion: None,
                })
                .await
                .unwrap();
        }

        let moves = store.list_moves(game.session_id).await.unwrap();
        assert_eq!(moves.len(), 3);
        assert_eq!(moves[2].san, "Nf3");
        assert_eq!(moves[2].move_number, 3);
    }

    #[tokio::test]
    async fn queue_lifecycle() {
        let store = test_store().await;
        let now = now_ms();
        let entry = QueueEntry {
            connection_id: "conn-1".into(),
            user_id: None,
            display_name: "Bob".into(),
            agent_name: None,
            engine_name: None,
            is_ranked: false,
            preferred_color: Some(Color::White),
            opponent_type: OpponentType::Either,
            time_controls: vec![TimeControlMode::Rapid],
            elo: DEFAULT_ELO,
            joined_at: now,
            expires_at: now + 60_000,
            status: QueueStatus::Waiting,
            matched_session_id: None,
        };
        store.join_queue(&entry).await.unwrap();

        let waiting = store.list_waiting_queue(now).await.unwrap();
        assert_eq!(waiting.len(), 1);

        let session = Uuid::new_v4();
        store.mark_queue_matched("conn-1", session).await.unwrap();
        let loaded = store.get_queue_entry("conn-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, QueueStatus::Matched);
        assert_eq!(loaded.matched_session_id, Some(session));
        assert!(store.list_waiting_queue(now).await.unwrap().is_empty());

        assert!(store.leave_queue("conn-1").await.unwrap());
        assert!(!store.leave_queue("conn-1").await.unwrap());
    }

    #[tokio::test]
    async fn queue_expiry_marks_overdue_entries() {
        let store = test_store().await;
        let now = now_ms();
        let mut entry = QueueEntry {
            connection_id: "conn-2".into(),
            user_id: None,
            display_name: "Eve".into(),
            agent_name: None,
            engine_name: None,
            is_ranked: false,
            preferred_color: None,
            opponent_type: OpponentType::Either,
            time_controls: vec![TimeControlMode::Blitz],
            elo: DEFAULT_ELO,
            joined_at: now - 10_000,
            expires_at: now - 1_000,
            status: QueueStatus::Waiting,
            matched_session_id: None,
        };
        store.join_queue(&entry).await.unwrap();
        entry.connection_id = "conn-3".into();
        entry.expires_at = now + 60_000;
        store.join_queue(&entry).await.unwrap();

        assert_eq!(store.expire_queue(now).await.unwrap(), 1);
        let loaded = store.get_queue_entry("conn-2").await.unwrap().unwrap();
        assert_eq!(loaded.status, QueueStatus::Expired);
        assert_eq!(store.list_waiting_queue(now).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn event_log_cursor_reads() {
        let store = test_store().await;
        let node = Uuid::new_v4();
        let start = store.latest_ws_event_id().await.unwrap();

        for i in 0..5 {
            store
                .append_ws_event(
                    "lobby",
                    &serde_json::json!({"type": "lobby_update", "n": i}),
                    node,
                    now_ms(),
                )
                .await
                .unwrap();
        }

        let first_batch = store.read_ws_events_since(start, 3).await.unwrap();
        assert_eq!(first_batch.len(), 3);
        let rest = store
            .read_ws_events_since(first_batch.last().unwrap().id, 100)
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|e| e.origin_node == node));
    }

    #[tokio::test]
    async fn ratings_upsert_and_leaderboard_order() {
        let store = test_store().await;
        for (id, elo) in [("u1", 1300), ("u2", 1500), ("u3", 1100)] {
            store
                .upsert_user_rating(&UserRating {
                    user_id: id.into(),
                    display_name: id.to_uppercase(),
                    elo,
                    games_played: 1,
                    wins: 1,
                    losses: 0,
                    draws: 0,
                })
                .await
                .unwrap();
        }
        let board = store.leaderboard(LadderKind::Players, 10).await.unwrap();
        let entries = board.as_array().unwrap();
        assert_eq!(entries[0]["userId"], "u2");
        assert_eq!(entries[2]["userId"], "u3");
    }
}
