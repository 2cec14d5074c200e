//! Single owner of the mirrored [`GameState`] and the reconciliation rules
//! deciding how each incoming snapshot lands.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::{error::ReconcileError, state::game::GameState};

/// How a snapshot should be reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPolicy {
    /// Diff against the previous snapshot unless a full replace is required.
    Reconcile {
        /// A locally initiated mutating request is in flight.
        action_pending: bool,
    },
    /// Replace wholesale (welcome, round start, explicit resync).
    ForceReplace,
}

/// Why a snapshot was applied wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceReason {
    Initial,
    RosterChanged,
    ActionPending,
    Forced,
    PatchRejected,
}

/// Strategy used for an applied snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    FullReplace(ReplaceReason),
    Incremental,
}

/// One coin-level difference written by an incremental patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoinChange {
    /// The coin at `index` flipped to `heads`.
    Set {
        player: String,
        index: usize,
        heads: bool,
    },
    /// A coin arrived at the end of the station.
    Appended {
        player: String,
        index: usize,
        heads: bool,
    },
    /// The station shrank; `index` and everything after it are gone.
    Trimmed { player: String, index: usize },
    /// The player's station disappeared from the coin map.
    Cleared { player: String },
}

impl CoinChange {
    /// Player whose station changed.
    pub fn player(&self) -> &str {
        match self {
            CoinChange::Set { player, .. }
            | CoinChange::Appended { player, .. }
            | CoinChange::Trimmed { player, .. }
            | CoinChange::Cleared { player } => player,
        }
    }

    /// Whether this change affects the coin at `index` on `player`'s station.
    pub fn touches(&self, player: &str, index: usize) -> bool {
        if self.player() != player {
            return false;
        }
        match self {
            CoinChange::Set { index: changed, .. } | CoinChange::Appended { index: changed, .. } => {
                *changed == index
            }
            CoinChange::Trimmed { index: from, .. } => index >= *from,
            CoinChange::Cleared { .. } => true,
        }
    }
}

/// Outcome of [`StateStore::apply_snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    pub mode: ApplyMode,
    /// Coin-level changes; empty for full replaces.
    pub coin_changes: Vec<CoinChange>,
}

impl ApplyOutcome {
    /// Whether the snapshot replaced the state wholesale.
    pub fn is_full_replace(&self) -> bool {
        matches!(self.mode, ApplyMode::FullReplace(_))
    }

    /// Whether the coin at `index` on `player`'s station changed.
    pub fn touched(&self, player: &str, index: usize) -> bool {
        self.coin_changes
            .iter()
            .any(|change| change.touches(player, index))
    }
}

/// In-memory mirror of the authoritative state plus the last applied snapshot.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    current: GameState,
    previous: Option<GameState>,
}

impl StateStore {
    /// Create an empty store; the first snapshot always lands as a full replace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current mirrored state.
    pub fn state(&self) -> &GameState {
        &self.current
    }

    /// Independent copy of the last applied snapshot, if any.
    pub fn previous(&self) -> Option<&GameState> {
        self.previous.as_ref()
    }

    /// Single mutation entry point for the mirrored state.
    pub fn apply_snapshot(&mut self, next: GameState, policy: ApplyPolicy) -> ApplyOutcome {
        let reason = match (&self.previous, policy) {
            (None, _) => Some(ReplaceReason::Initial),
            (Some(_), ApplyPolicy::ForceReplace) => Some(ReplaceReason::Forced),
            (Some(previous), _) if previous.players != next.players => {
                Some(ReplaceReason::RosterChanged)
            }
            (Some(_), ApplyPolicy::Reconcile { action_pending: true }) => {
                Some(ReplaceReason::ActionPending)
            }
            _ => None,
        };

        if let Some(reason) = reason {
            return self.replace(next, reason);
        }

        match self.patch(next.clone()) {
            Ok(changes) => {
                debug!(changes = changes.len(), "applied incremental snapshot");
                ApplyOutcome {
                    mode: ApplyMode::Incremental,
                    coin_changes: changes,
                }
            }
            Err(err) => {
                warn!(error = %err, "incremental patch rejected; replacing state");
                self.replace(next, ReplaceReason::PatchRejected)
            }
        }
    }

    /// Forget everything, including the previous snapshot, keeping only the room id.
    pub fn reset(&mut self) {
        let room_id = self.current.room_id.take();
        self.current = GameState {
            room_id,
            ..GameState::default()
        };
        self.previous = None;
    }

    fn replace(&mut self, mut next: GameState, reason: ReplaceReason) -> ApplyOutcome {
        debug!(?reason, "replacing mirrored state");
        // Authoritative snapshots define how many coins the room plays with.
        if matches!(reason, ReplaceReason::Initial | ReplaceReason::Forced)
            && !next.player_coins.is_empty()
        {
            next.total_coins = next.coins_in_play() + next.total_completed;
        }
        self.previous = Some(next.clone());
        self.current = next;
        ApplyOutcome {
            mode: ApplyMode::FullReplace(reason),
            coin_changes: Vec::new(),
        }
    }

    fn patch(&mut self, next: GameState) -> Result<Vec<CoinChange>, ReconcileError> {
        validate_snapshot(&next)?;
        let previous = self.previous.as_ref().unwrap_or(&self.current);
        let changes = diff_coins(previous, &next);

        let snapshot = next.clone();
        let coins = std::mem::take(&mut self.current.player_coins);
        self.current = GameState {
            player_coins: coins,
            ..next
        };
        apply_changes(&mut self.current, &changes);

        if self.current.player_coins != snapshot.player_coins {
            warn!("coin map drifted from previous snapshot; adopting incoming coins");
            self.current.player_coins = snapshot.player_coins.clone();
        }
        self.previous = Some(snapshot);
        Ok(changes)
    }
}

/// Structural checks an incremental patch relies on.
fn validate_snapshot(state: &GameState) -> Result<(), ReconcileError> {
    let roster: HashSet<&str> = state.players.iter().map(String::as_str).collect();
    if let Some(owner) = state
        .player_coins
        .keys()
        .find(|owner| !roster.contains(owner.as_str()))
    {
        return Err(ReconcileError::UnknownCoinOwner {
            player: owner.clone(),
        });
    }

    if !state.player_coins.is_empty() {
        let in_play = state.coins_in_play();
        if in_play + state.total_completed != state.total_coins {
            return Err(ReconcileError::CoinConservation {
                in_play,
                completed: state.total_completed,
                expected: state.total_coins,
            });
        }
    }

    Ok(())
}

/// Index-by-index coin diff; equal entries produce no change.
fn diff_coins(previous: &GameState, next: &GameState) -> Vec<CoinChange> {
    let mut changes = Vec::new();

    for (player, coins) in &next.player_coins {
        let old = previous
            .player_coins
            .get(player)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for (index, (before, after)) in old.iter().zip(coins).enumerate() {
            if before != after {
                changes.push(CoinChange::Set {
                    player: player.clone(),
                    index,
                    heads: *after,
                });
            }
        }
        for (index, heads) in coins.iter().enumerate().skip(old.len()) {
            changes.push(CoinChange::Appended {
                player: player.clone(),
                index,
                heads: *heads,
            });
        }
        if coins.len() < old.len() {
            changes.push(CoinChange::Trimmed {
                player: player.clone(),
                index: coins.len(),
            });
        }
    }

    for player in previous.player_coins.keys() {
        if !next.player_coins.contains_key(player) {
            changes.push(CoinChange::Cleared {
                player: player.clone(),
            });
        }
    }

    changes
}

fn apply_changes(state: &mut GameState, changes: &[CoinChange]) {
    for change in changes {
        match change {
            CoinChange::Set {
                player,
                index,
                heads,
            } => {
                if let Some(slot) = state
                    .player_coins
                    .get_mut(player)
                    .and_then(|coins| coins.get_mut(*index))
                {
                    *slot = *heads;
                }
            }
            CoinChange::Appended { player, heads, .. } => {
                state
                    .player_coins
                    .entry(player.clone())
                    .or_default()
                    .push(*heads);
            }
            CoinChange::Trimmed { player, index } => {
                if let Some(coins) = state.player_coins.get_mut(player) {
                    coins.truncate(*index);
                }
            }
            CoinChange::Cleared { player } => {
                state.player_coins.shift_remove(player);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::state::state_machine::Phase;

    fn state(coins: &[(&str, &[bool])], completed: u32) -> GameState {
        let player_coins: IndexMap<String, Vec<bool>> = coins
            .iter()
            .map(|(player, coins)| (player.to_string(), coins.to_vec()))
            .collect();
        GameState {
            players: coins.iter().map(|(player, _)| player.to_string()).collect(),
            phase: Phase::Active,
            player_coins,
            total_completed: completed,
            total_coins: 4,
            ..GameState::default()
        }
    }

    const RECONCILE: ApplyPolicy = ApplyPolicy::Reconcile {
        action_pending: false,
    };

    #[test]
    fn first_snapshot_is_a_full_replace() {
        let mut store = StateStore::new();
        let outcome = store.apply_snapshot(state(&[("ada", &[false; 4])], 0), RECONCILE);
        assert_eq!(outcome.mode, ApplyMode::FullReplace(ReplaceReason::Initial));
        assert_eq!(store.previous(), Some(store.state()));
    }

    #[test]
    fn forced_replace_adopts_the_servers_coin_count() {
        let mut store = StateStore::new();
        let opening = state(&[("ada", &[false; 5]), ("bob", &[false; 4])], 3);
        store.apply_snapshot(opening, RECONCILE);
        assert_eq!(store.state().total_coins, 12);

        let mut flipped = state(
            &[("ada", &[true, false, false, false, false]), ("bob", &[false; 4])],
            3,
        );
        flipped.total_coins = store.state().total_coins;
        let outcome = store.apply_snapshot(flipped, RECONCILE);
        assert_eq!(outcome.mode, ApplyMode::Incremental);

        let lobby = state(&[], 0);
        store.apply_snapshot(lobby, ApplyPolicy::ForceReplace);
        assert_eq!(store.state().total_coins, 4);
    }

    #[test]
    fn unchanged_coins_produce_no_changes() {
        let mut store = StateStore::new();
        let snapshot = state(&[("ada", &[false, true]), ("bob", &[false, false])], 0);
        store.apply_snapshot(snapshot.clone(), RECONCILE);

        let outcome = store.apply_snapshot(snapshot, RECONCILE);
        assert_eq!(outcome.mode, ApplyMode::Incremental);
        assert!(outcome.coin_changes.is_empty());
    }

    #[test]
    fn only_changed_indices_are_recorded() {
        let mut store = StateStore::new();
        store.apply_snapshot(
            state(&[("ada", &[false, false, false]), ("bob", &[false])], 0),
            RECONCILE,
        );

        let outcome = store.apply_snapshot(
            state(&[("ada", &[false, true, false]), ("bob", &[false])], 0),
            RECONCILE,
        );
        assert_eq!(
            outcome.coin_changes,
            vec![CoinChange::Set {
                player: "ada".into(),
                index: 1,
                heads: true,
            }]
        );
        assert_eq!(store.state().player_coins["ada"], vec![false, true, false]);
    }

    #[test]
    fn send_trims_the_tail_and_appends_downstream() {
        let mut store = StateStore::new();
        store.apply_snapshot(
            state(&[("ada", &[true, true, false]), ("bob", &[false])], 0),
            RECONCILE,
        );

        let outcome = store.apply_snapshot(
            state(&[("ada", &[false]), ("bob", &[false, false, false])], 0),
            RECONCILE,
        );
        assert!(outcome.coin_changes.contains(&CoinChange::Set {
            player: "ada".into(),
            index: 0,
            heads: false,
        }));
        assert!(outcome.coin_changes.contains(&CoinChange::Trimmed {
            player: "ada".into(),
            index: 1,
        }));
        assert!(outcome.touched("bob", 2));
        assert!(!outcome.touched("bob", 0));
        assert_eq!(store.state().player_coins["ada"], vec![false]);
        assert_eq!(store.state().player_coins["bob"], vec![false, false, false]);
    }

    #[test]
    fn roster_change_forces_full_replace() {
        let mut store = StateStore::new();
        store.apply_snapshot(state(&[("ada", &[false; 4])], 0), RECONCILE);
        let outcome = store.apply_snapshot(
            state(&[("ada", &[false; 2]), ("bob", &[false; 2])], 0),
            RECONCILE,
        );
        assert_eq!(
            outcome.mode,
            ApplyMode::FullReplace(ReplaceReason::RosterChanged)
        );
    }

    #[test]
    fn pending_action_forces_full_replace() {
        let mut store = StateStore::new();
        store.apply_snapshot(state(&[("ada", &[false; 4])], 0), RECONCILE);
        let outcome = store.apply_snapshot(
            state(&[("ada", &[true, false, false, false])], 0),
            ApplyPolicy::Reconcile {
                action_pending: true,
            },
        );
        assert_eq!(
            outcome.mode,
            ApplyMode::FullReplace(ReplaceReason::ActionPending)
        );
        assert!(store.state().player_coins["ada"][0]);
    }

    #[test]
    fn malformed_snapshot_falls_back_to_full_replace() {
        let mut store = StateStore::new();
        store.apply_snapshot(state(&[("ada", &[false; 4])], 0), RECONCILE);

        let mut broken = state(&[("ada", &[false; 4])], 0);
        broken.total_completed = 3;
        let outcome = store.apply_snapshot(broken.clone(), RECONCILE);
        assert_eq!(
            outcome.mode,
            ApplyMode::FullReplace(ReplaceReason::PatchRejected)
        );
        assert_eq!(store.state(), &broken);
    }

    #[test]
    fn previous_is_an_independent_copy() {
        let mut store = StateStore::new();
        store.apply_snapshot(state(&[("ada", &[false; 4])], 0), RECONCILE);
        store.apply_snapshot(state(&[("ada", &[true, false, false, false])], 0), RECONCILE);

        let previous = store.previous().cloned().unwrap();
        assert_eq!(&previous, store.state());
        store.reset();
        assert!(store.previous().is_none());
        assert!(previous.player_coins["ada"][0]);
    }
}
