//! The builtin agent.
//!
//! When the matchmaker cannot find a human or external agent for a
//! waiting entry, it seats this agent. The agent is an ordinary API
//! client: it polls the public read endpoint and posts moves over HTTP
//! against its own process, authenticating with an internally issued
//! `cmk_` key. The state machine has no idea it exists.

use crate::engine;
use crate::store::{GameStore, StoreError, UserAccount};
use crate::types::{ChessMove, Color, Position};
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;
use uuid::Uuid;

/// Ladder name of the builtin agent.
pub const AGENT_NAME: &str = "house-bot";
/// Engine tag, used by the matchmaker's same-engine exclusion.
pub const AGENT_ENGINE: &str = "builtin";
/// System account that owns the builtin agent.
const SYSTEM_USER_ID: &str = "system:house";
const SYSTEM_DISPLAY_NAME: &str = "House";

/// Consecutive request failures before a seat is abandoned.
const MAX_ERRORS: u32 = 5;
/// Poll period while waiting for the opponent to move.
const POLL: Duration = Duration::from_millis(400);

/// Generates an API key with the literal `cmk_` prefix.
pub fn generate_api_key() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..32)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect();
    format!("cmk_{}", suffix)
}

/// Creates the system account on first boot, or loads it. The account
/// auto-declines draws so bot games never sit on a pending offer.
pub async fn ensure_system_account(store: &GameStore) -> Result<UserAccount, StoreError> {
    if let Some(existing) = store.get_user(SYSTEM_USER_ID).await? {
        if existing.api_key.is_some() {
            return Ok(existing);
        }
    }
    let account = UserAccount {
        user_id: SYSTEM_USER_ID.to_string(),
        display_name: SYSTEM_DISPLAY_NAME.to_string(),
        api_key: Some(generate_api_key()),
        auto_decline_draws: true,
    };
    store.upsert_user(&account, crate::model::now_ms()).await?;
    log::info!("provisioned system account for the builtin agent");
    Ok(account)
}

/// Everything needed to drive one seat of the builtin agent.
#[derive(Clone)]
pub struct BuiltinAgent {
    /// Public API base of this process, e.g. `http://127.0.0.1:8080/api`.
    pub base_url: String,
    pub api_key: String,
    pub user_id: String,
    pub display_name: String,
}

impl BuiltinAgent {
    pub fn new(base_url: String, account: &UserAccount) -> Self {
        Self {
            base_url,
            api_key: account.api_key.clone().unwrap_or_default(),
            user_id: account.user_id.clone(),
            display_name: account.display_name.clone(),
        }
    }

    /// Starts the in-process game loop for one seat.
    pub fn spawn_seat(&self, session_id: Uuid, player_id: String) {
        let agent = self.clone();
        tokio::spawn(async move {
            if let Err(err) = agent.play(session_id, &player_id).await {
                log::warn!("builtin agent left game {}: {}", session_id, err);
            }
        });
    }

    async fn play(&self, session_id: Uuid, player_id: &str) -> Result<(), String> {
        let client = reqwest::Client::new();
        let game_url = format!("{}/games/{}", self.base_url, session_id);
        let move_url = format!("{}/games/{}/move", self.base_url, session_id);
        let mut errors = 0u32;

        loop {
            tokio::time::sleep(POLL).await;

            let snapshot: serde_json::Value = match self.fetch(&client, &game_url).await {
                Ok(snapshot) => {
                    errors = 0;
                    snapshot
                }
                Err(err) => {
                    errors += 1;
                    if errors >= MAX_ERRORS {
                        return Err(err);
                    }
                    continue;
                }
            };

            if snapshot["status"] == "complete" {
                log::debug!("builtin agent finished game {}", session_id);
                return Ok(());
            }

            let my_color = if snapshot["white"]["playerId"] == player_id {
                Color::White
            } else {
                Color::Black
            };
            let turn = snapshot["currentTurn"].as_str().unwrap_or("");
            if turn != my_color.to_string() {
                continue;
            }

            let fen = snapshot["fen"].as_str().unwrap_or("");
            let pos = Position::from_fen(fen).map_err(|err| err.to_string())?;
            let Some(mv) = choose_move(&pos) else {
                // No legal move means the game just ended; the next poll
                // will see it complete.
                continue;
            };

            let body = serde_json::json!({
                "playerId": player_id,
                "from": mv.from.to_algebraic(),
                "to": mv.to.to_algebraic(),
                "promotion": mv.promotion.map(|p| p.letter().to_string()),
            });
            let response = client
                .post(&move_url)
                .header("X-Api-Key", &self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|err| err.to_string())?;
            if !response.status().is_success() {
                // Lost a race with the clock or the opponent; re-read.
                log::debug!(
                    "builtin agent move rejected in {} ({})",
                    session_id,
                    response.status()
                );
            }
        }
    }

    async fn fetch(
        &self,
        client: &reqwest::Client,
        url: &str,
    ) -> Result<serde_json::Value, String> {
        client
            .get(url)
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(|err| err.to_string())?
            .json()
            .await
            .map_err(|err| err.to_string())
    }
}

/// Move selection: a mate in one if there is one, otherwise a random
/// capture, otherwise a random legal move.
fn choose_move(pos: &Position) -> Option<ChessMove> {
    let moves = engine::legal_moves(pos);
    if moves.is_empty() {
        return None;
    }

    for mv in &moves {
        let next = engine::apply_move(pos, mv);
        if engine::is_in_check(&next.board, next.turn) && engine::legal_moves(&next).is_empty() {
            return Some(*mv);
        }
    }

    let mut rng = rand::thread_rng();
    let captures: Vec<ChessMove> = moves
        .iter()
        .filter(|mv| pos.board.get(mv.to).is_some() || mv.is_en_passant)
        .copied()
        .collect();
    if let Some(mv) = captures.choose(&mut rng) {
        return Some(*mv);
    }
    moves.choose(&mut rng).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_keys_carry_the_prefix() {
        let key = generate_api_key();
        assert!(key.starts_with("cmk_"));
        assert_eq!(key.len(), 4 + 32);
    }

    #[test]
    fn chooses_mate_in_one_when_available() {
        // Back-rank mate: Ra8#.
        let pos = Position::from_fen("6k1/5ppp/8/8/8/8/8/R5K1 w - - 0 1").unwrap();
        let mv = choose_move(&pos).unwrap();
        assert_eq!(mv.from.to_algebraic(), "a1");
        assert_eq!(mv.to.to_algebraic(), "a8");
    }

    #[test]
    fn always_finds_some_move_in_open_positions() {
        let pos = Position::starting();
        assert!(choose_move(&pos).is_some());
    }
}
