//! Game-wide aggregates, recomputed on demand from the round history.

use std::collections::BTreeMap;

use indexmap::IndexMap;

use crate::{
    dto::summary::{BatchImpact, GameSummary, PlayerSummary},
    services::timer::round2,
    state::stats::{RoundResult, coins_per_minute},
};

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| round2(values.iter().sum::<f64>() / values.len() as f64))
}

fn min_max(values: &[f64]) -> (Option<f64>, Option<f64>) {
    let best = values.iter().copied().min_by(f64::total_cmp);
    let worst = values.iter().copied().max_by(f64::total_cmp);
    (best, worst)
}

/// Summarise `rounds`, or `None` when nothing has been recorded.
pub fn summarize(rounds: &[RoundResult]) -> Option<GameSummary> {
    if rounds.is_empty() {
        return None;
    }

    let durations = rounds
        .iter()
        .filter_map(|round| round.game_duration_seconds)
        .collect::<Vec<_>>();
    let lead_times = rounds
        .iter()
        .filter_map(|round| round.lead_time_seconds)
        .collect::<Vec<_>>();
    let (best_round_time, worst_round_time) = min_max(&durations);

    Some(GameSummary {
        rounds: rounds.to_vec(),
        rounds_played: rounds.len(),
        total_game_time: round2(durations.iter().sum()),
        incomplete_rounds: rounds.len() - durations.len(),
        average_round_time: mean(&durations),
        best_round_time,
        worst_round_time,
        average_lead_time: mean(&lead_times),
        batch_size_impact: batch_size_impact(rounds),
        player_summary: player_summary(rounds),
    })
}

fn batch_size_impact(rounds: &[RoundResult]) -> Vec<BatchImpact> {
    let mut by_batch: BTreeMap<u32, Vec<&RoundResult>> = BTreeMap::new();
    for round in rounds {
        by_batch.entry(round.batch_size).or_default().push(round);
    }

    by_batch
        .into_iter()
        .map(|(batch_size, group)| {
            let durations = group
                .iter()
                .filter_map(|round| round.game_duration_seconds)
                .collect::<Vec<_>>();
            let lead_times = group
                .iter()
                .filter_map(|round| round.lead_time_seconds)
                .collect::<Vec<_>>();
            let efficiencies = group
                .iter()
                .filter(|round| round.game_duration_seconds.is_some())
                .map(|round| round.efficiency)
                .collect::<Vec<_>>();
            BatchImpact {
                batch_size,
                rounds: group.len(),
                avg_duration: mean(&durations),
                avg_efficiency: mean(&efficiencies),
                avg_lead_time: mean(&lead_times),
            }
        })
        .collect()
}

#[derive(Default)]
struct PlayerTally {
    times: Vec<f64>,
    efficiencies: Vec<f64>,
}

fn player_summary(rounds: &[RoundResult]) -> IndexMap<String, PlayerSummary> {
    let mut tallies: IndexMap<String, PlayerTally> = IndexMap::new();

    for round in rounds {
        let stations = round.player_timers.len();
        if stations == 0 {
            continue;
        }
        let share = round.total_coins as f64 / stations as f64;
        for (player, timer) in &round.player_timers {
            let Some(duration) = timer.resolved_duration() else {
                continue;
            };
            let tally = tallies.entry(player.clone()).or_default();
            tally.times.push(duration);
            tally.efficiencies.push(coins_per_minute(share, Some(duration)));
        }
    }

    tallies
        .into_iter()
        .map(|(player, tally)| {
            let (best_time, worst_time) = min_max(&tally.times);
            let summary = PlayerSummary {
                rounds_completed: tally.times.len(),
                total_time: round2(tally.times.iter().sum()),
                avg_time: mean(&tally.times),
                best_time,
                worst_time,
                avg_efficiency: mean(&tally.efficiencies).unwrap_or(0.0),
            };
            (player, summary)
        })
        .collect()
}
