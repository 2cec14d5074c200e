use thiserror::Error;
use validator::ValidationErrors;

use crate::{
    services::api::ApiError,
    state::{guard::ActionClass, state_machine::LocalAction},
};

/// An inbound frame that could not be turned into a [`ServerMessage`](crate::dto::ws::ServerMessage).
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not JSON.
    #[error("frame is not valid JSON")]
    Json {
        #[source]
        source: serde_json::Error,
    },
    /// The frame has no string `type` discriminant.
    #[error("frame has no `type` discriminant")]
    MissingType,
    /// The payload does not match the shape of its known discriminant.
    #[error("malformed `{kind}` payload")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    /// Binary frame that is not UTF-8.
    #[error("binary frame is not UTF-8")]
    NotUtf8,
}

/// Reasons an incremental patch is refused in favour of a full replace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// Coins are listed for someone who is not on the roster.
    #[error("coins listed for `{player}`, who is not a player")]
    UnknownCoinOwner { player: String },
    /// Coins in play plus delivered coins do not add up.
    #[error("coin conservation violated: {in_play} in play + {completed} completed != {expected}")]
    CoinConservation {
        in_play: u32,
        completed: u32,
        expected: u32,
    },
}

/// Errors surfaced by locally initiated actions.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The same class of request is already in flight.
    #[error("a {0:?} request is already pending")]
    Busy(ActionClass),
    /// The current phase or role does not allow the action.
    #[error("{action:?} is not allowed: {reason}")]
    NotPermitted {
        action: LocalAction,
        reason: String,
    },
    /// The request failed local validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The server rejected the request or could not be reached.
    #[error("request failed")]
    Request(#[source] ApiError),
    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,
    /// The host left and the room is closed.
    #[error("room is closed")]
    Closed,
}

impl From<ApiError> for ActionError {
    fn from(err: ApiError) -> Self {
        ActionError::Request(err)
    }
}

impl From<ValidationErrors> for ActionError {
    fn from(err: ValidationErrors) -> Self {
        ActionError::InvalidInput(format!("validation failed: {}", err))
    }
}

/// Reasons a hold gesture cannot start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HoldError {
    #[error("coin {index} is already being held")]
    AlreadyHolding { index: usize },
    #[error("coin {index} has already been flipped")]
    AlreadyCommitted { index: usize },
    #[error("there is no tails coin at index {index}")]
    NoSuchCoin { index: usize },
    #[error("flipping is not allowed right now")]
    NotPermitted,
}

/// Websocket failures that end a connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to `{url}`")]
    Connect {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("websocket read failed")]
    Read {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
