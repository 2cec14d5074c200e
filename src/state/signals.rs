use serde::Serialize;
use tokio::sync::broadcast;

use crate::state::{
    game::Role,
    holds::CoinRef,
    state_machine::Phase,
    stats::InsertOutcome,
    store::ApplyMode,
};

/// Severity of an advisory shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Recoverable, user-visible message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Advisory {
    pub level: NoticeLevel,
    pub message: String,
}

impl Advisory {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Events pushed to the presentation layer besides the render callback.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    StateChanged { mode: ApplyMode },
    RoleChanged { from: Role, to: Role },
    PhaseChanged { from: Phase, to: Phase },
    PresenceChanged,
    RoundRecorded { round: u32, outcome: InsertOutcome },
    /// An optimistic flip was rolled back after its request failed.
    FlipReverted { coin: CoinRef },
    GameFinished,
    Notice(Advisory),
}

/// Broadcast hub fanning signals out to every subscriber.
pub struct SignalHub {
    sender: broadcast::Sender<SessionSignal>,
}

impl SignalHub {
    /// Construct a new hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent signals.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.sender.subscribe()
    }

    /// Send a signal to all current subscribers, ignoring delivery errors.
    pub fn emit(&self, signal: SessionSignal) {
        let _ = self.sender.send(signal);
    }
}
