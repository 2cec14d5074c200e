use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::game::Role;

/// High-level phases a room can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Participants gather, the host configures rounds.
    #[default]
    Lobby,
    /// Coins are moving; stations flip and send.
    Active,
    /// A round has finished and the next one has not started.
    RoundComplete,
    /// Final results are displayed.
    Results,
}

/// Inbound notifications that move the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// `game_started` or `round_started`.
    RoundStarted,
    /// `round_complete` without the game-over flag.
    RoundCompleted,
    /// `game_over`, or a `round_complete` carrying the game-over flag.
    GameOver,
    /// `game_reset`.
    Reset,
    /// A snapshot reporting the server's phase directly.
    Observed(Phase),
}

impl PhaseEvent {
    /// Phase the server is in after emitting this event.
    pub fn target(self) -> Phase {
        match self {
            PhaseEvent::RoundStarted => Phase::Active,
            PhaseEvent::RoundCompleted => Phase::RoundComplete,
            PhaseEvent::GameOver => Phase::Results,
            PhaseEvent::Reset => Phase::Lobby,
            PhaseEvent::Observed(phase) => phase,
        }
    }
}

/// Error returned when an event does not follow from the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the room was in when the event arrived.
    pub from: Phase,
    /// The event that does not follow from this phase.
    pub event: PhaseEvent,
}

/// Result of feeding an event to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseChange {
    pub from: Phase,
    pub to: Phase,
    /// Set when the event skipped a step and the server's phase was adopted anyway.
    pub forced: bool,
}

impl PhaseChange {
    /// Whether the phase actually changed.
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Locally initiated actions gated by phase and role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalAction {
    FlipCoin,
    SendBatch,
    ChangeRole,
    ConfigureRounds,
    StartGame,
    NextRound,
    ResetGame,
}

/// Phase tracker mirroring the server's round flow.
///
/// The server is authoritative: an event that skips a step is reported as an
/// [`InvalidTransition`] but its target phase is still adopted, so a client
/// that missed notifications converges instead of getting stuck.
#[derive(Debug, Clone, Default)]
pub struct PhaseMachine {
    phase: Phase,
    version: usize,
}

impl PhaseMachine {
    /// Create a machine in the lobby.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of phase changes applied so far.
    pub fn version(&self) -> usize {
        self.version
    }

    /// Apply `event`, adopting its target even when the step is invalid.
    pub fn apply(&mut self, event: PhaseEvent) -> (PhaseChange, Option<InvalidTransition>) {
        let from = self.phase;
        let (to, invalid) = match compute_transition(from, event) {
            Ok(next) => (next, None),
            Err(err) => (event.target(), Some(err)),
        };
        if to != from {
            self.phase = to;
            self.version += 1;
        }
        let change = PhaseChange {
            from,
            to,
            forced: invalid.is_some(),
        };
        (change, invalid)
    }

    /// Re-seat the machine on a phase taken from a full snapshot.
    pub fn resync(&mut self, phase: Phase) {
        if self.phase != phase {
            self.phase = phase;
            self.version += 1;
        }
    }
}

/// Compute the next phase for `event` if the step is valid.
pub fn compute_transition(from: Phase, event: PhaseEvent) -> Result<Phase, InvalidTransition> {
    let next = match (from, event) {
        (Phase::Lobby | Phase::RoundComplete | Phase::Active, PhaseEvent::RoundStarted) => {
            Phase::Active
        }
        (Phase::Active | Phase::RoundComplete, PhaseEvent::RoundCompleted) => Phase::RoundComplete,
        (_, PhaseEvent::GameOver) => Phase::Results,
        (_, PhaseEvent::Reset) => Phase::Lobby,
        (current, PhaseEvent::Observed(observed)) if current == observed => observed,
        (current, PhaseEvent::Observed(observed)) => {
            let implied = match observed {
                Phase::Lobby => PhaseEvent::Reset,
                Phase::Active => PhaseEvent::RoundStarted,
                Phase::RoundComplete => PhaseEvent::RoundCompleted,
                Phase::Results => PhaseEvent::GameOver,
            };
            return compute_transition(current, implied)
                .map_err(|_| InvalidTransition { from, event });
        }
        (from, event) => return Err(InvalidTransition { from, event }),
    };

    Ok(next)
}

/// Whether `role` may perform `action` while the room is in `phase`.
pub fn permits(phase: Phase, role: Role, action: LocalAction) -> bool {
    match action {
        LocalAction::FlipCoin | LocalAction::SendBatch => {
            phase == Phase::Active && role == Role::Player
        }
        LocalAction::ChangeRole | LocalAction::ConfigureRounds | LocalAction::StartGame => {
            phase == Phase::Lobby && role == Role::Host
        }
        LocalAction::NextRound => phase == Phase::RoundComplete && role == Role::Host,
        LocalAction::ResetGame => role == Role::Host,
    }
}
