//! Client-side mirror of the authoritative game state and the rules the
//! client needs to interpret it.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    dto::game::{GameSnapshotDto, TimerDto},
    services::timer::duration_between,
    state::state_machine::Phase,
};

/// Coins circulating in a round.
pub const TOTAL_COINS: u32 = 15;
/// Highest valid coin index on a station.
pub const MAX_COIN_INDEX: usize = TOTAL_COINS as usize - 1;
/// Stations on the production line.
pub const MAX_PLAYERS: usize = 5;
/// Fewest players a host may require.
pub const MIN_PLAYERS: u32 = 2;
/// Batch sizes the server accepts.
pub const VALID_BATCH_SIZES: [u32; 3] = [1, 5, 15];

/// Round structure chosen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundType {
    /// One round at the selected batch size.
    Single,
    /// Full batch, then single-piece flow.
    TwoRounds,
    /// Full batch, medium batch, then single-piece flow.
    #[default]
    ThreeRounds,
}

impl RoundType {
    /// Batch size of every round, in play order.
    pub fn batch_sizes(self, selected: Option<u32>) -> Vec<u32> {
        match self {
            RoundType::Single => vec![selected.unwrap_or(TOTAL_COINS)],
            RoundType::TwoRounds => vec![15, 1],
            RoundType::ThreeRounds => vec![15, 5, 1],
        }
    }

    /// Number of rounds this type plays.
    pub fn round_count(self) -> u32 {
        match self {
            RoundType::Single => 1,
            RoundType::TwoRounds => 2,
            RoundType::ThreeRounds => 3,
        }
    }
}

/// How the local participant relates to the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Controls configuration and round progression.
    Host,
    /// Owns a station on the line.
    Player,
    /// Watches without acting.
    Spectator,
    /// Not (yet) listed anywhere in the room.
    #[default]
    Unknown,
}

/// Start/end/duration triple used for stations and for the round clock.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Timer {
    #[serde(with = "crate::dto::timestamp")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "crate::dto::timestamp")]
    pub ended_at: Option<OffsetDateTime>,
    pub duration_seconds: Option<f64>,
}

impl Timer {
    /// Started but neither stopped nor given a final duration.
    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.ended_at.is_none() && self.duration_seconds.is_none()
    }

    /// Every field is empty.
    pub fn is_blank(&self) -> bool {
        self.started_at.is_none() && self.ended_at.is_none() && self.duration_seconds.is_none()
    }

    /// Reported duration, or the one implied by its timestamps.
    pub fn resolved_duration(&self) -> Option<f64> {
        self.duration_seconds
            .filter(|value| value.is_finite() && *value >= 0.0)
            .or_else(|| duration_between(self.started_at, self.ended_at))
    }
}

impl From<&TimerDto> for Timer {
    fn from(dto: &TimerDto) -> Self {
        Self {
            started_at: dto.started_at,
            ended_at: dto.ended_at,
            duration_seconds: dto.duration_seconds,
        }
    }
}

/// Reference marks used to compute the lead time of a round.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LeadTimeMarks {
    #[serde(with = "crate::dto::timestamp")]
    pub first_flip_at: Option<OffsetDateTime>,
    #[serde(with = "crate::dto::timestamp")]
    pub first_delivery_at: Option<OffsetDateTime>,
    /// Server-reported lead time, when available.
    pub lead_time_seconds: Option<f64>,
}

impl LeadTimeMarks {
    /// Reported lead time, or the one implied by the marks.
    pub fn resolved(&self) -> Option<f64> {
        self.lead_time_seconds
            .filter(|value| value.is_finite() && *value >= 0.0)
            .or_else(|| duration_between(self.first_flip_at, self.first_delivery_at))
    }
}

/// Everything the client knows about the room it is connected to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameState {
    pub room_id: Option<String>,
    /// Production-line order.
    pub players: Vec<String>,
    pub host: Option<String>,
    pub spectators: IndexSet<String>,
    pub phase: Phase,
    pub round_type: RoundType,
    pub required_players: u32,
    pub selected_batch_size: Option<u32>,
    pub current_round: u32,
    pub total_rounds: u32,
    pub batch_size: u32,
    /// `true` is heads (processed at that station).
    pub player_coins: IndexMap<String, Vec<bool>>,
    pub total_completed: u32,
    pub player_timers: IndexMap<String, Timer>,
    pub game_timer: Timer,
    pub lead_time: LeadTimeMarks,
    pub total_coins: u32,
}

impl Default for GameState {
    fn default() -> Self {
        Self {
            room_id: None,
            players: Vec::new(),
            host: None,
            spectators: IndexSet::new(),
            phase: Phase::Lobby,
            round_type: RoundType::default(),
            required_players: MAX_PLAYERS as u32,
            selected_batch_size: None,
            current_round: 0,
            total_rounds: RoundType::default().round_count(),
            batch_size: TOTAL_COINS,
            player_coins: IndexMap::new(),
            total_completed: 0,
            player_timers: IndexMap::new(),
            game_timer: Timer::default(),
            lead_time: LeadTimeMarks::default(),
            total_coins: TOTAL_COINS,
        }
    }
}

impl GameState {
    /// Overlay a partial snapshot on a copy of this state. Fields the
    /// snapshot does not carry keep their current value.
    pub fn merged(&self, snapshot: &GameSnapshotDto) -> GameState {
        let mut next = self.clone();

        if let Some(players) = &snapshot.players {
            next.players = players.clone();
        }
        if let Some(spectators) = &snapshot.spectators {
            next.spectators = spectators.iter().cloned().collect();
        }
        if let Some(host) = &snapshot.host {
            next.host = host.clone();
        }
        if let Some(phase) = snapshot.state {
            next.phase = phase;
        }
        if let Some(selected) = snapshot.selected_batch_size {
            next.selected_batch_size = selected;
        }
        if let Some(round_type) = snapshot.round_type {
            next.round_type = round_type;
            if snapshot.total_rounds.is_none() {
                next.total_rounds = round_type.round_count();
            }
        }
        if let Some(required) = snapshot.required_players {
            next.required_players = required;
        }
        if let Some(round) = snapshot.current_round {
            next.current_round = round;
        }
        if let Some(total) = snapshot.total_rounds {
            next.total_rounds = total;
        }
        if let Some(batch) = snapshot.batch_size {
            next.batch_size = batch;
        }
        if let Some(coins) = &snapshot.player_coins {
            next.player_coins = coins.clone();
        }
        if let Some(completed) = snapshot.total_completed {
            next.total_completed = completed;
        }
        if let Some(timers) = &snapshot.player_timers {
            next.player_timers = timers
                .iter()
                .map(|(player, timer)| (player.clone(), Timer::from(timer)))
                .collect();
        }
        if let Some(duration) = snapshot.game_duration_seconds {
            next.game_timer.duration_seconds = Some(duration);
        }
        if snapshot.started_at.is_some() {
            next.game_timer.started_at = snapshot.started_at;
        }
        if snapshot.ended_at.is_some() {
            next.game_timer.ended_at = snapshot.ended_at;
        }
        if snapshot.first_flip_at.is_some() {
            next.lead_time.first_flip_at = snapshot.first_flip_at;
        }
        if snapshot.first_delivery_at.is_some() {
            next.lead_time.first_delivery_at = snapshot.first_delivery_at;
        }
        if snapshot.lead_time_seconds.is_some() {
            next.lead_time.lead_time_seconds = snapshot.lead_time_seconds;
        }

        next
    }

    /// Coins still sitting on a station.
    pub fn coins_in_play(&self) -> u32 {
        self.player_coins.values().map(|coins| coins.len() as u32).sum()
    }

    /// Heads-up coins currently held by `player`.
    pub fn heads_count(&self, player: &str) -> usize {
        self.player_coins
            .get(player)
            .map(|coins| coins.iter().filter(|heads| **heads).count())
            .unwrap_or(0)
    }

    /// Rounds the configured game plays.
    pub fn expected_rounds(&self) -> u32 {
        if self.total_rounds > 0 {
            self.total_rounds
        } else {
            self.round_type.round_count()
        }
    }

    /// Batch sizes for rounds `1..=expected_rounds()`.
    pub fn batch_sequence(&self) -> Vec<u32> {
        self.round_type.batch_sizes(self.selected_batch_size)
    }

    /// Batch size used by round `round_number` (1-based).
    pub fn batch_size_for_round(&self, round_number: u32) -> u32 {
        let sequence = self.batch_sequence();
        round_number
            .checked_sub(1)
            .and_then(|index| sequence.get(index as usize).copied())
            .or_else(|| sequence.last().copied())
            .unwrap_or(TOTAL_COINS)
    }

    /// Role of `username` according to the host field and the rosters.
    pub fn role_of(&self, username: &str) -> Role {
        if self.host.as_deref() == Some(username) {
            Role::Host
        } else if self.players.iter().any(|player| player == username) {
            Role::Player
        } else if self.spectators.contains(username) {
            Role::Spectator
        } else {
            Role::Unknown
        }
    }

    /// Whether `player` has enough heads to forward a batch. The last coins
    /// of a round may leave in a short batch.
    pub fn can_send_batch(&self, player: &str) -> bool {
        let Some(coins) = self.player_coins.get(player) else {
            return false;
        };
        let heads = coins.iter().filter(|heads| **heads).count();
        heads > 0 && (heads >= self.batch_size as usize || heads == coins.len())
    }

    /// Coin at `index` on `player`'s station, if any.
    pub fn coin(&self, player: &str, index: usize) -> Option<bool> {
        self.player_coins.get(player)?.get(index).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(json: &str) -> GameSnapshotDto {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn batch_sequences_follow_round_type() {
        assert_eq!(RoundType::Single.batch_sizes(Some(5)), vec![5]);
        assert_eq!(RoundType::Single.batch_sizes(None), vec![15]);
        assert_eq!(RoundType::TwoRounds.batch_sizes(Some(5)), vec![15, 1]);
        assert_eq!(RoundType::ThreeRounds.batch_sizes(None), vec![15, 5, 1]);
    }

    #[test]
    fn merge_keeps_absent_fields() {
        let base = GameState {
            players: vec!["ada".into(), "bob".into()],
            host: Some("ada".into()),
            current_round: 2,
            ..GameState::default()
        };

        let merged = base.merged(&snapshot(r#"{"total_completed": 4}"#));
        assert_eq!(merged.players, base.players);
        assert_eq!(merged.host, base.host);
        assert_eq!(merged.current_round, 2);
        assert_eq!(merged.total_completed, 4);

        let hostless = base.merged(&snapshot(r#"{"host": null}"#));
        assert_eq!(hostless.host, None);
    }

    #[test]
    fn round_type_change_updates_round_count() {
        let merged = GameState::default().merged(&snapshot(
            r#"{"round_type": "single", "selected_batch_size": 5}"#,
        ));
        assert_eq!(merged.total_rounds, 1);
        assert_eq!(merged.batch_size_for_round(1), 5);
    }

    #[test]
    fn roles_are_derived_from_rosters() {
        let state = GameState {
            players: vec!["ada".into(), "bob".into()],
            host: Some("ada".into()),
            spectators: ["eve".to_string()].into_iter().collect(),
            ..GameState::default()
        };
        assert_eq!(state.role_of("ada"), Role::Host);
        assert_eq!(state.role_of("bob"), Role::Player);
        assert_eq!(state.role_of("eve"), Role::Spectator);
        assert_eq!(state.role_of("zed"), Role::Unknown);
    }

    #[test]
    fn batches_leave_full_or_as_the_last_coins() {
        let mut state = GameState {
            batch_size: 5,
            ..GameState::default()
        };
        state
            .player_coins
            .insert("ada".into(), vec![true, true, true, false, false, false]);
        assert!(!state.can_send_batch("ada"));

        state.player_coins.insert("ada".into(), vec![true, true]);
        assert!(state.can_send_batch("ada"));
        assert!(!state.can_send_batch("bob"));
    }
}
