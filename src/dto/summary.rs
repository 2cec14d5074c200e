use indexmap::IndexMap;
use serde::Serialize;

use crate::state::stats::RoundResult;

/// Game-wide lean metrics derived from every recorded round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameSummary {
    pub rounds: Vec<RoundResult>,
    pub rounds_played: usize,
    /// Sum of known round durations; rounds without one count as zero.
    pub total_game_time: f64,
    /// Rounds whose duration could not be recovered.
    pub incomplete_rounds: usize,
    pub average_round_time: Option<f64>,
    pub best_round_time: Option<f64>,
    pub worst_round_time: Option<f64>,
    pub average_lead_time: Option<f64>,
    /// Keyed by batch size, in ascending order.
    pub batch_size_impact: Vec<BatchImpact>,
    /// Keyed by player, in order of first appearance.
    pub player_summary: IndexMap<String, PlayerSummary>,
}

/// Averages for every round played with one batch size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchImpact {
    pub batch_size: u32,
    pub rounds: usize,
    pub avg_duration: Option<f64>,
    /// Mean over timed rounds only; `None` when no round in the group finished.
    pub avg_efficiency: Option<f64>,
    pub avg_lead_time: Option<f64>,
}

/// Cross-round statistics for a single station.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerSummary {
    pub rounds_completed: usize,
    pub total_time: f64,
    pub avg_time: Option<f64>,
    pub best_time: Option<f64>,
    pub worst_time: Option<f64>,
    /// Coins per minute assuming the coins of a round are split evenly across stations.
    pub avg_efficiency: f64,
}
