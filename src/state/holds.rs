//! Press-and-hold flip gestures and the optimistic flips they leave behind.
//!
//! A gesture starts `holding`; once the threshold elapses it is `committed`
//! and the coin is shown as heads until the server confirms or contradicts
//! it. Cancelling a hold returns the coin to idle without touching any state.

use std::{collections::HashMap, time::Duration};

use indexmap::IndexSet;
use serde::Serialize;
use tokio::{task::AbortHandle, time::Instant};
use tracing::debug;

use crate::{
    error::HoldError,
    state::{game::GameState, store::ApplyOutcome},
};

/// A coin on a specific station.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CoinRef {
    pub player: String,
    pub index: usize,
}

impl CoinRef {
    pub fn new(player: impl Into<String>, index: usize) -> Self {
        Self {
            player: player.into(),
            index,
        }
    }
}

/// Stage of a live gesture. Idle coins have no gesture at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStage {
    Holding,
    Committed,
}

#[derive(Debug)]
struct Gesture {
    stage: HoldStage,
    generation: u64,
    started: Instant,
    threshold: Duration,
    task: Option<AbortHandle>,
}

impl Gesture {
    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Live gestures keyed by coin plus the set of optimistic flips.
#[derive(Debug, Default)]
pub struct HoldTracker {
    gestures: HashMap<CoinRef, Gesture>,
    optimistic: IndexSet<CoinRef>,
    next_generation: u64,
}

impl HoldTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start holding `coin`. Returns the generation the commit must present.
    pub fn begin(&mut self, coin: CoinRef, threshold: Duration) -> Result<u64, HoldError> {
        if let Some(existing) = self.gestures.get(&coin) {
            return Err(match existing.stage {
                HoldStage::Holding => HoldError::AlreadyHolding { index: coin.index },
                HoldStage::Committed => HoldError::AlreadyCommitted { index: coin.index },
            });
        }
        if self.optimistic.contains(&coin) {
            return Err(HoldError::AlreadyCommitted { index: coin.index });
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        self.gestures.insert(
            coin,
            Gesture {
                stage: HoldStage::Holding,
                generation,
                started: Instant::now(),
                threshold,
                task: None,
            },
        );
        Ok(generation)
    }

    /// Attach the timer task that will commit the gesture.
    pub fn attach(&mut self, coin: &CoinRef, generation: u64, task: AbortHandle) {
        match self.gestures.get_mut(coin) {
            Some(gesture) if gesture.generation == generation => gesture.task = Some(task),
            _ => task.abort(),
        }
    }

    /// Stage of the gesture on `coin`, if any.
    pub fn stage(&self, coin: &CoinRef) -> Option<HoldStage> {
        self.gestures.get(coin).map(|gesture| gesture.stage)
    }

    /// Fraction of the threshold elapsed, in `0.0..=1.0`.
    pub fn progress(&self, coin: &CoinRef, now: Instant) -> Option<f64> {
        let gesture = self.gestures.get(coin)?;
        if gesture.stage == HoldStage::Committed || gesture.threshold.is_zero() {
            return Some(1.0);
        }
        let elapsed = now.saturating_duration_since(gesture.started);
        Some((elapsed.as_secs_f64() / gesture.threshold.as_secs_f64()).min(1.0))
    }

    /// Move a holding gesture to committed. True exactly once per gesture.
    pub fn commit(&mut self, coin: &CoinRef, generation: u64) -> bool {
        let Some(gesture) = self.gestures.get_mut(coin) else {
            return false;
        };
        if gesture.generation != generation || gesture.stage != HoldStage::Holding {
            return false;
        }
        gesture.stage = HoldStage::Committed;
        gesture.task = None;
        self.optimistic.insert(coin.clone());
        true
    }

    /// Release a gesture that has not committed, stopping its timer.
    pub fn cancel(&mut self, coin: &CoinRef) -> bool {
        match self.gestures.get(coin).map(|gesture| gesture.stage) {
            Some(HoldStage::Holding) => {
                if let Some(mut gesture) = self.gestures.remove(coin) {
                    gesture.abort();
                }
                debug!(player = %coin.player, index = coin.index, "hold cancelled");
                true
            }
            _ => false,
        }
    }

    /// Show `coin` as flipped before the server confirms it.
    pub fn mark_optimistic(&mut self, coin: CoinRef) -> bool {
        self.optimistic.insert(coin)
    }

    /// Roll back an optimistic flip whose request failed.
    pub fn revert(&mut self, coin: &CoinRef) -> bool {
        let had_gesture = self.gestures.remove(coin).is_some();
        self.optimistic.shift_remove(coin) || had_gesture
    }

    pub fn is_optimistic(&self, coin: &CoinRef) -> bool {
        self.optimistic.contains(coin)
    }

    /// Coins currently shown as flipped ahead of the server.
    pub fn optimistic(&self) -> impl Iterator<Item = &CoinRef> {
        self.optimistic.iter()
    }

    /// Number of gestures still holding or awaiting confirmation.
    pub fn active(&self) -> usize {
        self.gestures.len()
    }

    /// Drop every gesture and optimistic flip. Returns how many gestures were live.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.gestures.len();
        for (_, mut gesture) in self.gestures.drain() {
            gesture.abort();
        }
        self.optimistic.clear();
        count
    }

    /// Drop local state made stale by an applied snapshot: everything on a
    /// full replace, only the touched coins on an incremental patch, and any
    /// optimistic flip the server has now confirmed.
    pub fn reconcile(&mut self, outcome: &ApplyOutcome, state: &GameState) -> usize {
        if outcome.is_full_replace() {
            return self.cancel_all();
        }

        let stale = self
            .gestures
            .keys()
            .chain(self.optimistic.iter())
            .filter(|coin| {
                outcome.touched(&coin.player, coin.index)
                    || state.coin(&coin.player, coin.index) != Some(false)
            })
            .cloned()
            .collect::<IndexSet<_>>();

        for coin in &stale {
            if let Some(mut gesture) = self.gestures.remove(coin) {
                gesture.abort();
            }
            self.optimistic.shift_remove(coin);
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::state::store::{ApplyMode, CoinChange, ReplaceReason};

    const THRESHOLD: Duration = Duration::from_millis(800);

    fn state_with(coins: &[bool]) -> GameState {
        let mut player_coins = IndexMap::new();
        player_coins.insert("ada".to_string(), coins.to_vec());
        GameState {
            players: vec!["ada".into()],
            player_coins,
            ..GameState::default()
        }
    }

    fn incremental(changes: Vec<CoinChange>) -> ApplyOutcome {
        ApplyOutcome {
            mode: ApplyMode::Incremental,
            coin_changes: changes,
        }
    }

    #[test]
    fn gesture_commits_exactly_once() {
        let mut holds = HoldTracker::new();
        let coin = CoinRef::new("ada", 0);
        let generation = holds.begin(coin.clone(), THRESHOLD).unwrap();

        assert!(holds.commit(&coin, generation));
        assert!(!holds.commit(&coin, generation));
        assert_eq!(holds.stage(&coin), Some(HoldStage::Committed));
        assert!(holds.is_optimistic(&coin));
        assert_eq!(
            holds.begin(coin.clone(), THRESHOLD),
            Err(HoldError::AlreadyCommitted { index: 0 })
        );
    }

    #[test]
    fn cancelled_gesture_cannot_commit() {
        let mut holds = HoldTracker::new();
        let coin = CoinRef::new("ada", 1);
        let generation = holds.begin(coin.clone(), THRESHOLD).unwrap();

        assert!(holds.cancel(&coin));
        assert!(!holds.commit(&coin, generation));
        assert_eq!(holds.stage(&coin), None);
        assert!(!holds.is_optimistic(&coin));
    }

    #[test]
    fn stale_generation_is_ignored() {
        let mut holds = HoldTracker::new();
        let coin = CoinRef::new("ada", 2);
        let first = holds.begin(coin.clone(), THRESHOLD).unwrap();
        holds.cancel(&coin);
        let second = holds.begin(coin.clone(), THRESHOLD).unwrap();

        assert!(!holds.commit(&coin, first));
        assert!(holds.commit(&coin, second));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_tracks_the_threshold() {
        let mut holds = HoldTracker::new();
        let coin = CoinRef::new("ada", 0);
        holds.begin(coin.clone(), THRESHOLD).unwrap();

        tokio::time::advance(Duration::from_millis(400)).await;
        let progress = holds.progress(&coin, Instant::now()).unwrap();
        assert!((progress - 0.5).abs() < 1e-9);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(holds.progress(&coin, Instant::now()), Some(1.0));
    }

    #[test]
    fn full_replace_drops_everything() {
        let mut holds = HoldTracker::new();
        holds.begin(CoinRef::new("ada", 0), THRESHOLD).unwrap();
        holds.mark_optimistic(CoinRef::new("ada", 1));

        let outcome = ApplyOutcome {
            mode: ApplyMode::FullReplace(ReplaceReason::ActionPending),
            coin_changes: Vec::new(),
        };
        assert_eq!(holds.reconcile(&outcome, &state_with(&[false, false])), 1);
        assert_eq!(holds.active(), 0);
        assert_eq!(holds.optimistic().count(), 0);
    }

    #[test]
    fn incremental_patch_drops_only_touched_coins() {
        let mut holds = HoldTracker::new();
        holds.begin(CoinRef::new("ada", 0), THRESHOLD).unwrap();
        holds.begin(CoinRef::new("ada", 1), THRESHOLD).unwrap();

        let outcome = incremental(vec![CoinChange::Set {
            player: "ada".into(),
            index: 1,
            heads: true,
        }]);
        assert_eq!(holds.reconcile(&outcome, &state_with(&[false, true])), 1);
        assert_eq!(holds.stage(&CoinRef::new("ada", 0)), Some(HoldStage::Holding));
        assert_eq!(holds.stage(&CoinRef::new("ada", 1)), None);
    }

    #[test]
    fn revert_clears_optimistic_flip() {
        let mut holds = HoldTracker::new();
        let coin = CoinRef::new("ada", 0);
        let generation = holds.begin(coin.clone(), THRESHOLD).unwrap();
        holds.commit(&coin, generation);

        assert!(holds.revert(&coin));
        assert!(!holds.is_optimistic(&coin));
        assert!(holds.begin(coin, THRESHOLD).is_ok());
    }
}
