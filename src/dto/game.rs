use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{DefaultOnNull, serde_as};
use time::OffsetDateTime;

use crate::state::{game::RoundType, state_machine::Phase};

/// Timer triple as serialised by the server for players and rounds.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TimerDto {
    #[serde(default, with = "crate::dto::timestamp")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "crate::dto::timestamp")]
    pub ended_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

/// Partial game snapshot. Every field is optional: absent fields keep the
/// value already mirrored locally when merged.
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GameSnapshotDto {
    #[serde(default)]
    pub players: Option<Vec<String>>,
    #[serde(default)]
    pub spectators: Option<Vec<String>>,
    /// `Some(None)` when the server explicitly reports "no host".
    #[serde(default, with = "::serde_with::rust::double_option")]
    pub host: Option<Option<String>>,
    #[serde(default)]
    pub state: Option<Phase>,
    #[serde(default)]
    pub round_type: Option<RoundType>,
    #[serde(default)]
    pub required_players: Option<u32>,
    #[serde(default, with = "::serde_with::rust::double_option")]
    pub selected_batch_size: Option<Option<u32>>,
    #[serde(default)]
    pub current_round: Option<u32>,
    #[serde(default)]
    pub total_rounds: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub player_coins: Option<IndexMap<String, Vec<bool>>>,
    #[serde(default)]
    pub total_completed: Option<u32>,
    #[serde(default)]
    pub player_timers: Option<IndexMap<String, TimerDto>>,
    #[serde(default)]
    pub game_duration_seconds: Option<f64>,
    #[serde(default, with = "crate::dto::timestamp")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "crate::dto::timestamp")]
    pub ended_at: Option<OffsetDateTime>,
    #[serde(default, with = "crate::dto::timestamp")]
    pub first_flip_at: Option<OffsetDateTime>,
    #[serde(default, with = "crate::dto::timestamp")]
    pub first_delivery_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub lead_time_seconds: Option<f64>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub round_results: Vec<RoundResultDto>,
}

/// Round result as reported by the server, possibly with missing fields.
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoundResultDto {
    #[serde(default)]
    pub round_number: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub game_duration_seconds: Option<f64>,
    #[serde(default)]
    pub lead_time_seconds: Option<f64>,
    #[serde(default, with = "crate::dto::timestamp")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "crate::dto::timestamp")]
    pub ended_at: Option<OffsetDateTime>,
    #[serde(default, with = "crate::dto::timestamp")]
    pub first_flip_at: Option<OffsetDateTime>,
    #[serde(default, with = "crate::dto::timestamp")]
    pub first_delivery_at: Option<OffsetDateTime>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub player_timers: IndexMap<String, TimerDto>,
    #[serde(default)]
    pub total_completed: Option<u32>,
    #[serde(default)]
    pub total_coins: Option<u32>,
}
