//! Elo rating computation.
//!
//! Pure math; applying the results to the ladders happens in the game
//! state machine on ranked completion.

use crate::model::EloChanges;
use crate::types::Color;

/// K-factor while a player has fewer than this many rated games.
const PROVISIONAL_GAMES: i32 = 30;
const K_PROVISIONAL: f64 = 40.0;
const K_ESTABLISHED: f64 = 20.0;
const K_FLOOR: f64 = 10.0;
const K_CEILING: f64 = 40.0;

/// Stored ratings never drop below this.
pub const ELO_FLOOR: i32 = 100;

/// Expected score of `rating` against `opponent`.
pub fn expected_score(rating: i32, opponent: i32) -> f64 {
    1.0 / (1.0 + 10f64.powf((opponent as f64 - rating as f64) / 400.0))
}

/// K-factor by experience, clamped.
pub fn k_factor(games_played: i32) -> f64 {
    let k = if games_played < PROVISIONAL_GAMES {
        K_PROVISIONAL
    } else {
        K_ESTABLISHED
    };
    k.clamp(K_FLOOR, K_CEILING)
}

/// Computes the rating deltas for a completed ranked game.
///
/// One K governs the whole game so the deltas stay zero-sum; the less
/// established side's K is the one used.
pub fn compute_changes(
    white_elo: i32,
    white_games: i32,
    black_elo: i32,
    black_games: i32,
    winner: Option<Color>,
) -> EloChanges {
    let white_score = match winner {
        Some(Color::White) => 1.0,
        Some(Color::Black) => 0.0,
        None => 0.5,
    };
    let white_expected = expected_score(white_elo, black_elo);
    let k = k_factor(white_games).max(k_factor(black_games));

    let white_change = (k * (white_score - white_expected)).round() as i32;
    let black_change = -white_change;

    EloChanges {
        white_change,
        black_change,
        white_new: (white_elo + white_change).max(ELO_FLOOR),
        black_new: (black_elo + black_change).max(ELO_FLOOR),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_ratings_win_moves_half_k() {
        let changes = compute_changes(1200, 50, 1200, 50, Some(Color::White));
        assert_eq!(changes.white_change, 10); // K=20, expected 0.5
        assert_eq!(changes.black_change, -10);
        assert_eq!(changes.white_new, 1210);
        assert_eq!(changes.black_new, 1190);
    }

    #[test]
    fn changes_are_zero_sum_and_bounded() {
        let cases = [
            (1200, 0, 1200, 0, Some(Color::White)),
            (1500, 10, 1100, 100, Some(Color::Black)),
            (1100, 100, 1500, 10, None),
            (2000, 500, 800, 2, Some(Color::White)),
        ];
        for (we, wg, be, bg, winner) in cases {
            let changes = compute_changes(we, wg, be, bg, winner);
            assert_eq!(
                changes.white_change + changes.black_change,
                0,
                "not zero-sum for {:?}",
                (we, wg, be, bg, winner)
            );
            let k = k_factor(wg).max(k_factor(bg)) as i32;
            assert!(changes.white_change.abs() <= k);
        }
    }

    #[test]
    fn provisional_players_move_faster() {
        let provisional = compute_changes(1200, 0, 1200, 0, Some(Color::White));
        let established = compute_changes(1200, 50, 1200, 50, Some(Color::White));
        assert!(provisional.white_change > established.white_change);
    }

    #[test]
    fn upset_wins_pay_more_than_expected_wins() {
        let upset = compute_changes(1100, 50, 1500, 50, Some(Color::White));
        let expected = compute_changes(1500, 50, 1100, 50, Some(Color::White));
        assert!(upset.white_change > expected.white_change);
    }

    #[test]
    fn draw_moves_points_toward_the_underdog() {
        let changes = compute_changes(1500, 50, 1100, 50, None);
        assert!(changes.white_change < 0);
        assert!(changes.black_change > 0);
    }

    #[test]
    fn stored_rating_never_falls_below_the_floor() {
        let changes = compute_changes(105, 50, 110, 50, Some(Color::Black));
        assert!(changes.white_change < 0);
        assert_eq!(changes.white_new, ELO_FLOOR);
    }
}
