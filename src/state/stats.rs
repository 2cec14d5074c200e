//! Round history: one result per round number, repaired and completed so
//! summaries never silently omit a round.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::{
    dto::game::RoundResultDto,
    services::timer::{duration_between, round2},
    state::{
        game::{GameState, Timer},
        state_machine::Phase,
    },
};

/// Throughput in coins per minute, rounded to cents. Zero when the duration
/// is missing or not positive.
pub fn coins_per_minute(coins: f64, duration_seconds: Option<f64>) -> f64 {
    match duration_seconds {
        Some(duration) if duration.is_finite() && duration > 0.0 => round2(coins / duration * 60.0),
        _ => 0.0,
    }
}

/// Where a recorded round came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// Sent by the server in `round_complete` or `game_over`.
    Reported,
    /// Recovered from the live state when the server never reported it.
    Extracted,
    /// Synthesised so the round is not missing; carries no measurements.
    Placeholder,
}

/// A station's time within one round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerRanking {
    pub player: String,
    pub duration_seconds: f64,
}

/// Measurements for one completed round plus metrics derived at insertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundResult {
    pub round_number: u32,
    pub batch_size: u32,
    pub game_duration_seconds: Option<f64>,
    pub lead_time_seconds: Option<f64>,
    #[serde(with = "crate::dto::timestamp")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "crate::dto::timestamp")]
    pub ended_at: Option<OffsetDateTime>,
    #[serde(with = "crate::dto::timestamp")]
    pub first_flip_at: Option<OffsetDateTime>,
    #[serde(with = "crate::dto::timestamp")]
    pub first_delivery_at: Option<OffsetDateTime>,
    pub player_timers: IndexMap<String, Timer>,
    pub total_completed: u32,
    pub total_coins: u32,
    pub source: ResultSource,
    pub efficiency: f64,
    pub player_rankings: Vec<PlayerRanking>,
    pub avg_player_time: Option<f64>,
    /// Percentage of the round's coins that were delivered.
    pub completion_rate: f64,
}

impl RoundResult {
    /// Build from a server report, repairing missing fields from the live state.
    pub fn from_report(dto: RoundResultDto, fallback_round: u32, live: &GameState) -> Self {
        let round_number = dto.round_number.unwrap_or(fallback_round);
        let mut result = Self {
            round_number,
            batch_size: dto
                .batch_size
                .unwrap_or_else(|| live.batch_size_for_round(round_number)),
            game_duration_seconds: dto.game_duration_seconds,
            lead_time_seconds: dto.lead_time_seconds,
            started_at: dto.started_at,
            ended_at: dto.ended_at,
            first_flip_at: dto.first_flip_at,
            first_delivery_at: dto.first_delivery_at,
            player_timers: dto
                .player_timers
                .iter()
                .map(|(player, timer)| (player.clone(), Timer::from(timer)))
                .collect(),
            total_completed: dto.total_completed.unwrap_or(live.total_completed),
            total_coins: dto.total_coins.unwrap_or(live.total_coins),
            source: ResultSource::Reported,
            efficiency: 0.0,
            player_rankings: Vec::new(),
            avg_player_time: None,
            completion_rate: 0.0,
        };
        result.repair(live);
        result.with_derived_metrics()
    }

    /// Snapshot the live state's current round.
    pub fn from_live(live: &GameState) -> Self {
        let result = Self {
            round_number: live.current_round,
            batch_size: live.batch_size,
            game_duration_seconds: live.game_timer.resolved_duration(),
            lead_time_seconds: live.lead_time.resolved(),
            started_at: live.game_timer.started_at,
            ended_at: live.game_timer.ended_at,
            first_flip_at: live.lead_time.first_flip_at,
            first_delivery_at: live.lead_time.first_delivery_at,
            player_timers: live.player_timers.clone(),
            total_completed: live.total_completed,
            total_coins: live.total_coins,
            source: ResultSource::Extracted,
            efficiency: 0.0,
            player_rankings: Vec::new(),
            avg_player_time: None,
            completion_rate: 0.0,
        };
        result.with_derived_metrics()
    }

    /// Stand-in for a round no data survived for. Durations stay absent.
    pub fn placeholder(round_number: u32, batch_size: u32, total_coins: u32) -> Self {
        Self {
            round_number,
            batch_size,
            game_duration_seconds: None,
            lead_time_seconds: None,
            started_at: None,
            ended_at: None,
            first_flip_at: None,
            first_delivery_at: None,
            player_timers: IndexMap::new(),
            total_completed: 0,
            total_coins,
            source: ResultSource::Placeholder,
            efficiency: 0.0,
            player_rankings: Vec::new(),
            avg_player_time: None,
            completion_rate: 0.0,
        }
    }

    /// Whether this entry is a placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.source == ResultSource::Placeholder
    }

    /// Fill gaps from timestamps and, for the live round, from the live timers.
    fn repair(&mut self, live: &GameState) {
        let same_round = live.current_round == self.round_number;

        if !self.game_duration_seconds.is_some_and(f64::is_finite) {
            self.game_duration_seconds = duration_between(self.started_at, self.ended_at)
                .or_else(|| same_round.then(|| live.game_timer.resolved_duration()).flatten());
        }
        if !self.lead_time_seconds.is_some_and(f64::is_finite) {
            self.lead_time_seconds = duration_between(self.first_flip_at, self.first_delivery_at)
                .or_else(|| same_round.then(|| live.lead_time.resolved()).flatten());
        }

        if same_round && self.player_timers.is_empty() && !live.player_timers.is_empty() {
            warn!(round = self.round_number, "round reported without timers; using live timers");
            self.player_timers = live.player_timers.clone();
        }
        for (player, timer) in self.player_timers.iter_mut() {
            if same_round && timer.is_blank() {
                if let Some(live_timer) = live.player_timers.get(player) {
                    *timer = live_timer.clone();
                }
            }
            if timer.duration_seconds.is_none() {
                timer.duration_seconds = duration_between(timer.started_at, timer.ended_at);
            }
        }
    }

    fn with_derived_metrics(mut self) -> Self {
        self.efficiency = coins_per_minute(self.total_completed as f64, self.game_duration_seconds);

        let mut rankings = self
            .player_timers
            .iter()
            .filter_map(|(player, timer)| {
                timer.resolved_duration().map(|duration| PlayerRanking {
                    player: player.clone(),
                    duration_seconds: duration,
                })
            })
            .collect::<Vec<_>>();
        rankings.sort_by(|a, b| a.duration_seconds.total_cmp(&b.duration_seconds));

        self.avg_player_time = (!rankings.is_empty()).then(|| {
            let total: f64 = rankings.iter().map(|rank| rank.duration_seconds).sum();
            round2(total / rankings.len() as f64)
        });
        self.player_rankings = rankings;
        self.completion_rate = if self.total_coins > 0 {
            round2(self.total_completed as f64 / self.total_coins as f64 * 100.0)
        } else {
            0.0
        };
        self
    }
}

/// What happened to a result handed to [`StatsAggregator::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    ReplacedPlaceholder,
    /// A result for this round already exists and was kept.
    Duplicate,
}

/// Rounds added by [`StatsAggregator::ensure_complete`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub extracted: Option<u32>,
    pub placeholders: Vec<u32>,
}

impl RepairReport {
    /// Whether anything had to be synthesised.
    pub fn is_empty(&self) -> bool {
        self.extracted.is_none() && self.placeholders.is_empty()
    }
}

/// Append-only round history keyed by round number.
#[derive(Debug, Clone, Default)]
pub struct StatsAggregator {
    rounds: BTreeMap<u32, RoundResult>,
}

impl StatsAggregator {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded rounds in round order.
    pub fn rounds(&self) -> impl Iterator<Item = &RoundResult> {
        self.rounds.values()
    }

    /// Result for `round_number`, if recorded.
    pub fn get(&self, round_number: u32) -> Option<&RoundResult> {
        self.rounds.get(&round_number)
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    /// Forget every round (reset, reconfiguration).
    pub fn clear(&mut self) {
        self.rounds.clear();
    }

    /// Record a server-reported round after repairing it against `live`.
    pub fn record(
        &mut self,
        dto: RoundResultDto,
        fallback_round: u32,
        live: &GameState,
    ) -> InsertOutcome {
        self.insert(RoundResult::from_report(dto, fallback_round, live))
    }

    /// Insert a result. Duplicates are dropped; only placeholders may be overwritten.
    pub fn insert(&mut self, result: RoundResult) -> InsertOutcome {
        let round = result.round_number;
        let outcome = match self.rounds.get(&round) {
            None => InsertOutcome::Inserted,
            Some(existing) if existing.is_placeholder() && !result.is_placeholder() => {
                InsertOutcome::ReplacedPlaceholder
            }
            Some(_) => return InsertOutcome::Duplicate,
        };
        info!(round, source = ?result.source, ?outcome, "round result recorded");
        self.rounds.insert(round, result);
        outcome
    }

    /// Guarantee one result for every round in `1..=live.expected_rounds()`:
    /// extract the live round when the server never reported it, then fill
    /// whatever is still missing with placeholders.
    pub fn ensure_complete(&mut self, live: &GameState) -> RepairReport {
        let expected = live.expected_rounds();
        let mut report = RepairReport::default();

        let current = live.current_round;
        let round_over = matches!(live.phase, Phase::RoundComplete | Phase::Results);
        let missing_or_placeholder = self
            .rounds
            .get(&current)
            .is_none_or(RoundResult::is_placeholder);
        if round_over && (1..=expected).contains(&current) && missing_or_placeholder {
            warn!(round = current, "round missing from history; extracting from live state");
            self.insert(RoundResult::from_live(live));
            report.extracted = Some(current);
        }

        for round in 1..=expected {
            if self.rounds.contains_key(&round) {
                continue;
            }
            warn!(round, "no data for round; inserting placeholder");
            self.rounds.insert(
                round,
                RoundResult::placeholder(round, live.batch_size_for_round(round), live.total_coins),
            );
            report.placeholders.push(round);
        }

        report
    }
}
