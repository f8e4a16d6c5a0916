//! The matchmaker: queue, pairing, and builtin-agent injection.
//!
//! Players (and external agents) join a queue keyed by a client-supplied
//! connection id. A periodic tick walks the waiting entries in join
//! order, pairs the first compatible couple, creates the game with both
//! seats filled, and pushes `match_found` on each entry's private
//! channel. A lone entry that has waited long enough and accepts AI
//! opponents gets the builtin agent instead.
//!
//! The matchmaker is the only mutator of queue entries; `leave` from the
//! API delegates through it. Every queue change re-broadcasts the lobby
//! projection.

use crate::agent::{self, BuiltinAgent};
use crate::bus::EventBus;
use crate::config::Config;
use crate::error::ApiError;
use crate::game::GameManager;
use crate::model::*;
use crate::store::GameStore;
use crate::types::Color;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use utoipa::ToSchema;
use uuid::Uuid;

/// What `GET /matchmaking/status` returns.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusView {
    /// 1-based place in the waiting line; 0 when not waiting.
    pub position: usize,
    pub estimated_wait_secs: u64,
    pub status: QueueStatus,
    pub matched_session_id: Option<Uuid>,
}

/// A request to enter the queue, already identity-resolved by the API.
#[derive(Debug, Clone)]
pub struct JoinQueueRequest {
    pub connection_id: String,
    pub user_id: Option<String>,
    pub display_name: String,
    pub agent_name: Option<String>,
    pub engine_name: Option<String>,
    pub is_ranked: bool,
    pub preferred_color: Option<Color>,
    pub opponent_type: OpponentType,
    pub time_controls: Vec<TimeControlMode>,
}

pub struct Matchmaker {
    store: GameStore,
    bus: Arc<EventBus>,
    games: Arc<GameManager>,
    config: Config,
    /// Absent in tests that run without an HTTP listener; injection is
    /// skipped entirely then.
    builtin: Option<BuiltinAgent>,
}

impl Matchmaker {
    pub fn new(
        store: GameStore,
        bus: Arc<EventBus>,
        games: Arc<GameManager>,
        config: Config,
        builtin: Option<BuiltinAgent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            games,
            config,
            builtin,
        })
    }

    // -----------------------------------------------------------------------
    // Queue membership
    // -----------------------------------------------------------------------

    pub async fn join_queue(&self, req: JoinQueueRequest) -> Result<QueueEntry, ApiError> {
        if req.time_controls.is_empty() {
            return Err(ApiError::Validation(
                "at least one time control is required".to_string(),
            ));
        }
        if req.is_ranked && req.user_id.is_none() {
            return Err(ApiError::Unauthorized(
                "ranked matchmaking requires authentication".to_string(),
            ));
        }

        let elo = self
            .current_elo(req.user_id.as_deref(), req.agent_name.as_deref())
            .await?;
        let now = now_ms();
        let entry = QueueEntry {
            connection_id: req.connection_id,
            user_id: req.user_id,
            display_name: req.display_name,
            agent_name: req.agent_name,
            engine_name: req.engine_name,
            is_ranked: req.is_ranked,
            preferred_color: req.preferred_color,
            opponent_type: req.opponent_type,
            time_controls: req.time_controls,
            elo,
            joined_at: now,
            expires_at: now + self.config.queue_expiry_secs * 1000,
            status: QueueStatus::Waiting,
            matched_session_id: None,
        };
        self.store.join_queue(&entry).await?;
        log::info!("{} joined the queue ({})", entry.display_name, entry.connection_id);
        self.broadcast_lobby().await?;
        Ok(entry)
    }

    pub async fn leave_queue(&self, connection_id: &str) -> Result<bool, ApiError> {
        let removed = self.store.leave_queue(connection_id).await?;
        if removed {
            log::info!("queue entry {} left", connection_id);
            self.broadcast_lobby().await?;
        }
        Ok(removed)
    }

    pub async fn status(&self, connection_id: &str) -> Result<QueueStatusView, ApiError> {
        let entry = self
            .store
            .get_queue_entry(connection_id)
            .await?
            .ok_or_else(|| {
                ApiError::NotFound(format!("no queue entry for {}", connection_id))
            })?;

        let position = if entry.status == QueueStatus::Waiting {
            let waiting = self.store.list_waiting_queue(now_ms()).await?;
            waiting
                .iter()
                .position(|e| e.connection_id == entry.connection_id)
                .map(|idx| idx + 1)
                .unwrap_or(0)
        } else {
            0
        };

        Ok(QueueStatusView {
            position,
            estimated_wait_secs: position as u64 * self.config.matchmaker_tick_secs,
            status: entry.status,
            matched_session_id: entry.matched_session_id,
        })
    }

    /// The public lobby projection: non-expired waiting entries.
    pub async fn lobby(&self) -> Result<Vec<LobbyEntry>, ApiError> {
        let waiting = self.store.list_waiting_queue(now_ms()).await?;
        Ok(waiting.iter().map(LobbyEntry::from).collect())
    }

    async fn broadcast_lobby(&self) -> Result<(), ApiError> {
        let entries = self.lobby().await?;
        self.bus
            .publish(Channel::Lobby, EventPayload::LobbyUpdate { entries })
            .await;
        Ok(())
    }

    async fn current_elo(
        &self,
        user_id: Option<&str>,
        agent_name: Option<&str>,
    ) -> Result<i32, ApiError> {
        Ok(match (user_id, agent_name) {
            (Some(user), Some(agent)) => self
                .store
                .get_agent_rating(user, agent)
                .await?
                .map(|r| r.elo)
                .unwrap_or(DEFAULT_ELO),
            (Some(user), None) => self
                .store
                .get_user_rating(user)
                .await?
                .map(|r| r.elo)
                .unwrap_or(DEFAULT_ELO),
            _ => DEFAULT_ELO,
        })
    }

    // -----------------------------------------------------------------------
    // The pairing tick
    // -----------------------------------------------------------------------

    /// Runs the tick loop forever.
    pub async fn run(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.matchmaker_tick_secs.max(1)));
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                log::warn!("matchmaker tick failed: {}", err);
            }
        }
    }

    /// One pass: expire, pair, inject the builtin agent, refresh the lobby.
    pub async fn tick(&self) -> Result<(), ApiError> {
        let now = now_ms();
        let mut changed = self.store.expire_queue(now).await? > 0;

        let mut waiting = self.store.list_waiting_queue(now).await?;

        // Pair greedily in join order: the first compatible pair for the
        // oldest entry wins, then the scan continues on the remainder.
        let mut i = 0;
        while i < waiting.len() {
            let mut matched_with = None;
            for j in (i + 1)..waiting.len() {
                if let Some(mode) = compatible(&waiting[i], &waiting[j]) {
                    matched_with = Some((j, mode));
                    break;
                }
            }
            match matched_with {
                Some((j, mode)) => {
                    let b = waiting.remove(j);
                    let a = waiting.remove(i);
                    self.pair(&a, &b, mode).await?;
                    changed = true;
                }
                None => i += 1,
            }
        }

        // Whoever is left and has waited long enough may get the house.
        for entry in &waiting {
            if self.should_inject_bot(entry, now) {
                self.inject_bot(entry).await?;
                changed = true;
            }
        }

        if changed {
            self.broadcast_lobby().await?;
        }
        Ok(())
    }

    async fn pair(
        &self,
        a: &QueueEntry,
        b: &QueueEntry,
        mode: TimeControlMode,
    ) -> Result<(), ApiError> {
        let (white, black) = assign_colors(a, b);
        let game = self
            .games
            .create_matched_game(
                slot_from_entry(white),
                slot_from_entry(black),
                TimeControl::from_mode(mode),
                a.is_ranked && b.is_ranked,
            )
            .await?;

        for entry in [a, b] {
            self.store
                .mark_queue_matched(&entry.connection_id, game.session_id)
                .await?;
            self.bus
                .publish(
                    Channel::Match(entry.connection_id.clone()),
                    EventPayload::MatchFound {
                        session_id: game.session_id,
                    },
                )
                .await;
        }
        log::info!(
            "paired {} and {} into game {} ({})",
            a.display_name,
            b.display_name,
            game.session_id,
            mode
        );
        Ok(())
    }

    fn should_inject_bot(&self, entry: &QueueEntry, now: i64) -> bool {
        self.builtin.is_some()
            && accepts_opponent(entry.opponent_type, true)
            && entry.engine_name.as_deref() != Some(agent::AGENT_ENGINE)
            && now - entry.joined_at >= self.config.bot_wait_secs * 1000
    }

    async fn inject_bot(&self, entry: &QueueEntry) -> Result<(), ApiError> {
        let Some(builtin) = &self.builtin else {
            return Ok(());
        };

        let mode = entry
            .time_controls
            .iter()
            .min_by_key(|m| m.as_str())
            .copied()
            .unwrap_or(TimeControlMode::Rapid);

        let bot_player_id = Uuid::new_v4().to_string();
        let bot_elo = self
            .store
            .get_agent_rating(&builtin.user_id, agent::AGENT_NAME)
            .await?
            .map(|r| r.elo)
            .unwrap_or(DEFAULT_ELO);
        let bot_slot = PlayerSlot {
            player_id: bot_player_id.clone(),
            display_name: builtin.display_name.clone(),
            user_id: Some(builtin.user_id.clone()),
            agent_name: Some(agent::AGENT_NAME.to_string()),
            engine_name: Some(agent::AGENT_ENGINE.to_string()),
            elo_at_join: Some(bot_elo),
            client_software: None,
        };

        // The human keeps their color preference; the house takes the rest.
        let human_color = entry
            .preferred_color
            .unwrap_or_else(|| random_color());
        let human_slot = slot_from_entry(entry);
        let (white, black) = match human_color {
            Color::White => (human_slot, bot_slot),
            Color::Black => (bot_slot, human_slot),
        };

        // Ranked bot games only happen for authenticated, ranked entries.
        let ranked = entry.is_ranked && entry.user_id.is_some();
        let game = self
            .games
            .create_matched_game(white, black, TimeControl::from_mode(mode), ranked)
            .await?;

        self.store
            .mark_queue_matched(&entry.connection_id, game.session_id)
            .await?;
        self.bus
            .publish(
                Channel::Match(entry.connection_id.clone()),
                EventPayload::MatchFound {
                    session_id: game.session_id,
                },
            )
            .await;

        builtin.spawn_seat(game.session_id, bot_player_id);
        log::info!(
            "injected the builtin agent against {} in game {}",
            entry.display_name,
            game.session_id
        );
        Ok(())
    }
}

/// One side's view: does `viewer` accept an opponent of that class?
fn accepts_opponent(viewer: OpponentType, other_is_agent: bool) -> bool {
    match viewer {
        OpponentType::Either => true,
        OpponentType::Human => !other_is_agent,
        OpponentType::Ai => other_is_agent,
    }
}

/// Full compatibility check. Returns the chosen time-control mode, which
/// is the lexicographically smallest mode both entries accept.
fn compatible(a: &QueueEntry, b: &QueueEntry) -> Option<TimeControlMode> {
    // Ranked only pairs with ranked.
    if a.is_ranked != b.is_ranked {
        return None;
    }
    if a.is_ranked && (a.user_id.is_none() || b.user_id.is_none()) {
        return None;
    }

    if !accepts_opponent(a.opponent_type, b.is_agent())
        || !accepts_opponent(b.opponent_type, a.is_agent())
    {
        return None;
    }

    // Two copies of the same engine make for a pointless game.
    if let (Some(ea), Some(eb)) = (a.engine_name.as_deref(), b.engine_name.as_deref())
        && !ea.is_empty()
        && ea == eb
    {
        return None;
    }

    // Irreconcilable color demands.
    if let (Some(ca), Some(cb)) = (a.preferred_color, b.preferred_color)
        && ca == cb
    {
        return None;
    }

    a.time_controls
        .iter()
        .filter(|mode| b.time_controls.contains(mode))
        .min_by_key(|mode| mode.as_str())
        .copied()
}

/// Resolves colors: a stated preference is honored, the opposite side
/// goes to the opponent, and with no preferences the coin decides.
fn assign_colors<'a>(a: &'a QueueEntry, b: &'a QueueEntry) -> (&'a QueueEntry, &'a QueueEntry) {
    match (a.preferred_color, b.preferred_color) {
        (Some(Color::White), _) | (_, Some(Color::Black)) => (a, b),
        (Some(Color::Black), _) | (_, Some(Color::White)) => (b, a),
        (None, None) => {
            if rand::thread_rng().gen_bool(0.5) {
                (a, b)
            } else {
                (b, a)
            }
        }
    }
}

fn random_color() -> Color {
    if rand::thread_rng().gen_bool(0.5) {
        Color::White
    } else {
        Color::Black
    }
}

/// A queue entry becomes a seat; the connection id doubles as the player
/// token so the matched client can play straight away.
fn slot_from_entry(entry: &QueueEntry) -> PlayerSlot {
    PlayerSlot {
        player_id: entry.connection_id.clone(),
        display_name: entry.display_name.clone(),
        user_id: entry.user_id.clone(),
        agent_name: entry.agent_name.clone(),
        engine_name: entry.engine_name.clone(),
        elo_at_join: Some(entry.elo),
        client_software: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::connect;

    fn entry(connection_id: &str) -> QueueEntry {
        QueueEntry {
            connection_id: connection_id.to_string(),
            user_id: None,
            display_name: connection_id.to_uppercase(),
            agent_name: None,
            engine_name: None,
            is_ranked: false,
            preferred_color: None,
            opponent_type: OpponentType::Either,
            time_controls: vec![TimeControlMode::Rapid, TimeControlMode::Standard],
            elo: DEFAULT_ELO,
            joined_at: now_ms(),
            expires_at: now_ms() + 60_000,
            status: QueueStatus::Waiting,
            matched_session_id: None,
        }
    }

    #[test]
    fn compatibility_picks_smallest_common_mode() {
        let mut a = entry("a");
        let mut b = entry("b");
        a.time_controls = vec![TimeControlMode::Standard, TimeControlMode::Blitz];
        b.time_controls = vec![TimeControlMode::Rapid, TimeControlMode::Standard];
        assert_eq!(compatible(&a, &b), Some(TimeControlMode::Standard));

        b.time_controls = vec![TimeControlMode::Blitz, TimeControlMode::Standard];
        assert_eq!(compatible(&a, &b), Some(TimeControlMode::Blitz));

        b.time_controls = vec![TimeControlMode::Unlimited];
        assert_eq!(compatible(&a, &b), None);
    }

    #[test]
    fn same_engine_entries_never_pair() {
        let mut a = entry("a");
        let mut b = entry("b");
        a.agent_name = Some("alpha".into());
        a.engine_name = Some("stockfish".into());
        b.agent_name = Some("beta".into());
        b.engine_name = Some("stockfish".into());
        assert_eq!(compatible(&a, &b), None);

        b.engine_name = Some("other".into());
        assert!(compatible(&a, &b).is_some());
    }

    #[test]
    fn opponent_type_matrix() {
        let mut human = entry("h");
        human.opponent_type = OpponentType::Human;
        let mut bot = entry("b");
        bot.agent_name = Some("bot".into());
        bot.opponent_type = OpponentType::Either;

        // The human only wants humans.
        assert_eq!(compatible(&human, &bot), None);

        human.opponent_type = OpponentType::Ai;
        assert!(compatible(&human, &bot).is_some());

        // An AI-only entry will not take a human.
        let mut other_human = entry("h2");
        other_human.opponent_type = OpponentType::Either;
        assert_eq!(compatible(&human, &other_human), None);
    }

    #[test]
    fn ranked_never_pairs_with_unranked() {
        let mut a = entry("a");
        let mut b = entry("b");
        a.is_ranked = true;
        a.user_id = Some("u-a".into());
        b.is_ranked = false;
        assert_eq!(compatible(&a, &b), None);

        b.is_ranked = true;
        b.user_id = Some("u-b".into());
        assert!(compatible(&a, &b).is_some());
    }

    #[test]
    fn identical_color_demands_block_pairing() {
        let mut a = entry("a");
        let mut b = entry("b");
        a.preferred_color = Some(Color::White);
        b.preferred_color = Some(Color::White);
        assert_eq!(compatible(&a, &b), None);

        b.preferred_color = Some(Color::Black);
        assert!(compatible(&a, &b).is_some());
        let (white, black) = assign_colors(&a, &b);
        assert_eq!(white.connection_id, "a");
        assert_eq!(black.connection_id, "b");
    }

    #[test]
    fn single_preference_gives_the_opponent_the_opposite() {
        let mut a = entry("a");
        let b = entry("b");
        a.preferred_color = Some(Color::Black);
        let (white, black) = assign_colors(&a, &b);
        assert_eq!(white.connection_id, "b");
        assert_eq!(black.connection_id, "a");
    }

    // -- store-backed tick tests ------------------------------------------

    async fn fixture() -> (Arc<Matchmaker>, GameStore) {
        let pool = connect("sqlite::memory:").await.unwrap();
        let store = GameStore::new(pool);
        store.init_schema().await.unwrap();
        let bus = Arc::new(EventBus::new(store.clone(), None, Uuid::new_v4()));
        let games = GameManager::new(store.clone(), bus.clone(), Config::default());
        let matchmaker = Matchmaker::new(store.clone(), bus, games, Config::default(), None);
        (matchmaker, store)
    }

    #[tokio::test]
    async fn tick_pairs_compatible_entries_and_notifies_them() {
        let (matchmaker, store) = fixture().await;
        store.join_queue(&entry("a")).await.unwrap();
        store.join_queue(&entry("b")).await.unwrap();

        matchmaker.tick().await.unwrap();

        let a = store.get_queue_entry("a").await.unwrap().unwrap();
        let b = store.get_queue_entry("b").await.unwrap().unwrap();
        assert_eq!(a.status, QueueStatus::Matched);
        assert_eq!(b.status, QueueStatus::Matched);
        assert_eq!(a.matched_session_id, b.matched_session_id);

        let session = a.matched_session_id.unwrap();
        let game = store.get_game(session).await.unwrap().unwrap().game;
        assert_eq!(game.status, GameStatus::Active);
        assert_eq!(game.game_type, GameType::Matchmaking);
        assert_eq!(game.seated(), 2);
        // The connection ids are the player tokens.
        let tokens: Vec<String> = [&game.white, &game.black]
            .iter()
            .map(|slot| slot.as_ref().unwrap().player_id.clone())
            .collect();
        assert!(tokens.contains(&"a".to_string()));
        assert!(tokens.contains(&"b".to_string()));

        // Each entry got a match_found envelope on its private channel.
        let events = store.read_ws_events_since(0, 100).await.unwrap();
        let match_channels: Vec<&str> = events
            .iter()
            .map(|e| e.channel.as_str())
            .filter(|c| c.starts_with("match:"))
            .collect();
        assert!(match_channels.contains(&"match:a"));
        assert!(match_channels.contains(&"match:b"));
    }

    #[tokio::test]
    async fn same_engine_scenario_pairs_the_older_entry_with_the_newcomer() {
        let (matchmaker, store) = fixture().await;
        let mut first = entry("sf-1");
        first.engine_name = Some("stockfish".into());
        first.joined_at -= 2_000;
        let mut second = entry("sf-2");
        second.engine_name = Some("stockfish".into());
        second.joined_at -= 1_000;
        let mut third = entry("other");
        third.engine_name = Some("other".into());

        for e in [&first, &second, &third] {
            store.join_queue(e).await.unwrap();
        }

        matchmaker.tick().await.unwrap();

        let first = store.get_queue_entry("sf-1").await.unwrap().unwrap();
        let second = store.get_queue_entry("sf-2").await.unwrap().unwrap();
        let third = store.get_queue_entry("other").await.unwrap().unwrap();
        assert_eq!(first.status, QueueStatus::Matched);
        assert_eq!(third.status, QueueStatus::Matched);
        assert_eq!(first.matched_session_id, third.matched_session_id);
        assert_eq!(second.status, QueueStatus::Waiting);
    }

    #[tokio::test]
    async fn tick_expires_overdue_entries() {
        let (matchmaker, store) = fixture().await;
        let mut stale = entry("stale");
        stale.expires_at = now_ms() - 1;
        store.join_queue(&stale).await.unwrap();

        matchmaker.tick().await.unwrap();

        let loaded = store.get_queue_entry("stale").await.unwrap().unwrap();
        assert_eq!(loaded.status, QueueStatus::Expired);
    }

    #[tokio::test]
    async fn lone_entry_gets_the_builtin_agent() {
        let pool = connect("sqlite::memory:").await.unwrap();
        let store = GameStore::new(pool);
        store.init_schema().await.unwrap();
        let account = agent::ensure_system_account(&store).await.unwrap();
        let builtin = BuiltinAgent::new("http://127.0.0.1:1/api".into(), &account);

        let bus = Arc::new(EventBus::new(store.clone(), None, Uuid::new_v4()));
        let games = GameManager::new(store.clone(), bus.clone(), Config::default());
        let mut config = Config::default();
        config.bot_wait_secs = 0;
        let matchmaker = Matchmaker::new(store.clone(), bus, games, config, Some(builtin));

        let mut lone = entry("lone");
        lone.preferred_color = Some(Color::White);
        store.join_queue(&lone).await.unwrap();

        matchmaker.tick().await.unwrap();

        let lone = store.get_queue_entry("lone").await.unwrap().unwrap();
        assert_eq!(lone.status, QueueStatus::Matched);
        let game = store
            .get_game(lone.matched_session_id.unwrap())
            .await
            .unwrap()
            .unwrap()
            .game;
        assert_eq!(game.status, GameStatus::Active);
        let white = game.white.as_ref().unwrap();
        let black = game.black.as_ref().unwrap();
        assert_eq!(white.player_id, "lone");
        assert_eq!(black.agent_name.as_deref(), Some(agent::AGENT_NAME));
        assert_eq!(black.engine_name.as_deref(), Some(agent::AGENT_ENGINE));
    }

    #[tokio::test]
    async fn human_only_entries_never_get_the_bot() {
        let pool = connect("sqlite::memory:").await.unwrap();
        let store = GameStore::new(pool);
        store.init_schema().await.unwrap();
        let account = agent::ensure_system_account(&store).await.unwrap();
        let builtin = BuiltinAgent::new("http://127.0.0.1:1/api".into(), &account);

        let bus = Arc::new(EventBus::new(store.clone(), None, Uuid::new_v4()));
        let games = GameManager::new(store.clone(), bus.clone(), Config::default());
        let mut config = Config::default();
        config.bot_wait_secs = 0;
        let matchmaker = Matchmaker::new(store.clone(), bus, games, config, Some(builtin));

        let mut lone = entry("purist");
        lone.opponent_type = OpponentType::Human;
        store.join_queue(&lone).await.unwrap();

        matchmaker.tick().await.unwrap();

        let lone = store.get_queue_entry("purist").await.unwrap().unwrap();
        assert_eq!(lone.status, QueueStatus::Waiting);
    }
}
