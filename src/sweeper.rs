//! The cleanup sweeper.
//!
//! Per-node clock timers are in-memory and die with the process. This
//! background task periodically scans active timed games and drives the
//! timeout transition for any whose deadline has passed, so a game whose
//! timer was lost to a restart still completes within one sweep period.
//! The CAS guard inside the state machine makes a redundant sweep a no-op.
//!
//! The same scan doubles as the clock-sync heartbeat: games that still
//! have time on the clock get a `time_update` frame so subscribers can
//! correct drift between moves.

use crate::bus::EventBus;
use crate::game::GameManager;
use crate::model::{Channel, EventPayload};
use std::sync::Arc;
use std::time::Duration;

pub struct Sweeper {
    games: Arc<GameManager>,
    bus: Arc<EventBus>,
    period: Duration,
}

impl Sweeper {
    pub fn new(games: Arc<GameManager>, bus: Arc<EventBus>, period_secs: u64) -> Self {
        Self {
            games,
            bus,
            period: Duration::from_secs(period_secs.max(1)),
        }
    }

    /// Runs the scan loop forever.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.period);
        loop {
            ticker.tick().await;
            if let Err(err) = self.sweep().await {
                log::warn!("sweep failed: {}", err);
            }
        }
    }

    /// One scan. Returns how many games were timed out.
    pub async fn sweep(&self) -> Result<usize, crate::error::ApiError> {
        let now = crate::model::now_ms();
        let candidates = self.games.store().list_active_timed_games().await?;
        let mut completed = 0;

        for game in candidates {
            let Some(deadline) = game.deadline() else {
                continue;
            };
            if deadline > now {
                let session_id = game.session_id;
                self.bus
                    .publish(Channel::Session(session_id), EventPayload::TimeUpdate { game })
                    .await;
                continue;
            }
            match self.games.timeout(game.session_id).await {
                Ok(true) => {
                    completed += 1;
                    log::info!("sweeper timed out game {}", game.session_id);
                }
                // Already completed between the scan and the apply.
                Ok(false) => {}
                Err(err) => log::warn!("sweeper could not finish {}: {}", game.session_id, err),
            }
        }
        Ok(completed)
    }
}
