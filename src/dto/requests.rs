//! Outbound request bodies, validated locally before anything is sent.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::state::game::{MAX_COIN_INDEX, MAX_PLAYERS, MIN_PLAYERS, RoundType, VALID_BATCH_SIZES};

/// Longest username the server accepts.
pub const MAX_USERNAME_LEN: usize = 20;

/// `MAX_USERNAME_LEN` as the `u64` the `validator` length check expects.
const MAX_USERNAME_LEN_U64: u64 = MAX_USERNAME_LEN as u64;

/// Join a room, either as a player or as a spectator.
#[derive(Debug, Clone, Serialize, Validate)]
pub struct JoinRequest {
    #[validate(length(min = 1, max = MAX_USERNAME_LEN_U64))]
    pub username: String,
}

/// Flip a single coin owned by `username`.
#[derive(Debug, Clone, Serialize, Validate)]
pub struct FlipRequest {
    #[validate(length(min = 1, max = MAX_USERNAME_LEN_U64))]
    pub username: String,
    #[validate(range(max = MAX_COIN_INDEX))]
    pub coin_index: usize,
}

/// Forward the flipped coins of `username` to the next station.
#[derive(Debug, Clone, Serialize, Validate)]
pub struct SendRequest {
    #[validate(length(min = 1, max = MAX_USERNAME_LEN_U64))]
    pub username: String,
}

/// Role a participant can switch to from the lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleRequest {
    Player,
    Spectator,
}

/// Host request to move a participant between players and spectators.
#[derive(Debug, Clone, Serialize, Validate)]
pub struct ChangeRoleRequest {
    #[validate(length(min = 1, max = MAX_USERNAME_LEN_U64))]
    pub username: String,
    pub role: RoleRequest,
}

/// Host request configuring the round structure before the game starts.
#[derive(Debug, Clone, Serialize)]
pub struct RoundConfigRequest {
    pub round_type: RoundType,
    pub selected_batch_size: Option<u32>,
    pub required_players: u32,
}

impl Validate for RoundConfigRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !(MIN_PLAYERS..=MAX_PLAYERS as u32).contains(&self.required_players) {
            let mut err = ValidationError::new("required_players_range");
            err.message = Some(
                format!(
                    "required players must be between {MIN_PLAYERS} and {MAX_PLAYERS} (got {})",
                    self.required_players
                )
                .into(),
            );
            errors.add("required_players", err);
        }

        match (self.round_type, self.selected_batch_size) {
            (RoundType::Single, None) => {
                let mut err = ValidationError::new("batch_size_required");
                err.message = Some("single rounds need a selected batch size".into());
                errors.add("selected_batch_size", err);
            }
            (_, Some(size)) if !VALID_BATCH_SIZES.contains(&size) => {
                let mut err = ValidationError::new("batch_size_value");
                err.message =
                    Some(format!("batch size must be one of {VALID_BATCH_SIZES:?} (got {size})").into());
                errors.add("selected_batch_size", err);
            }
            _ => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Response of `POST /game/create`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRoomResponse {
    pub room_id: String,
}

/// Error body returned by the server on non-success statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub detail: Option<String>,
}
