use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use serde_with::{DefaultOnNull, serde_as};
use time::OffsetDateTime;

use crate::{
    dto::game::{GameSnapshotDto, RoundResultDto, TimerDto},
    error::DecodeError,
    state::{game::RoundType, state_machine::Phase},
};

/// Inbound notifications pushed by the server over the websocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "welcome")]
    Welcome(WelcomePayload),
    #[serde(rename = "game_state")]
    GameState(PhaseNoticePayload),
    #[serde(rename = "action_made")]
    ActionMade(ActionMadePayload),
    #[serde(rename = "game_started")]
    GameStarted(RoundStartPayload),
    #[serde(rename = "round_started")]
    RoundStarted(RoundStartPayload),
    #[serde(rename = "round_complete")]
    RoundComplete(RoundCompletePayload),
    #[serde(rename = "game_over")]
    GameOver(GameOverPayload),
    #[serde(rename = "game_reset")]
    GameReset(GameResetPayload),
    #[serde(rename = "round_config_update")]
    RoundConfigUpdate(RoundConfigPayload),
    #[serde(rename = "activity")]
    Activity(ActivityPayload),
    #[serde(rename = "user_joined")]
    UserJoined(UserJoinedPayload),
    #[serde(rename = "user_connected")]
    UserConnected(PresencePayload),
    #[serde(rename = "user_reconnected")]
    UserReconnected(PresencePayload),
    #[serde(rename = "user_disconnected")]
    UserDisconnected(PresencePayload),
    #[serde(rename = "host_disconnected")]
    HostDisconnected(PresencePayload),
    #[serde(other)]
    Unknown,
}

/// Decoded frame together with the raw discriminant it carried.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub kind: String,
    pub message: ServerMessage,
}

impl InboundFrame {
    /// Decode a text frame. The discriminant is extracted first so decode
    /// failures and unknown tags can be reported by name.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|source| DecodeError::Json { source })?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(DecodeError::MissingType)?;
        let message = serde_json::from_value::<ServerMessage>(value).map_err(|source| {
            DecodeError::Payload {
                kind: kind.clone(),
                source,
            }
        })?;
        Ok(Self { kind, message })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WelcomePayload {
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub game_state: GameSnapshotDto,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhaseNoticePayload {
    pub state: Phase,
    #[serde(default)]
    pub snapshot: Option<GameSnapshotDto>,
}

/// Kind of player action reported by `action_made`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Flip,
    Send,
    #[serde(other)]
    Other,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct ActionMadePayload {
    pub player: String,
    pub action: ActionKind,
    #[serde(default)]
    pub coin_index: Option<usize>,
    #[serde(default)]
    pub batch_count: Option<u32>,
    pub player_coins: IndexMap<String, Vec<bool>>,
    #[serde(default)]
    pub total_completed: Option<u32>,
    #[serde(default)]
    pub state: Option<Phase>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub player_timers: IndexMap<String, TimerDto>,
    #[serde(default)]
    pub game_duration_seconds: Option<f64>,
    #[serde(default)]
    pub round_complete: bool,
    #[serde(default)]
    pub game_over: bool,
    #[serde(default)]
    pub current_round: Option<u32>,
}

impl From<&ActionMadePayload> for GameSnapshotDto {
    /// Only coin, timer and completion data; `action_made` never moves the phase.
    fn from(payload: &ActionMadePayload) -> Self {
        Self {
            player_coins: Some(payload.player_coins.clone()),
            total_completed: payload.total_completed,
            player_timers: (!payload.player_timers.is_empty())
                .then(|| payload.player_timers.clone()),
            game_duration_seconds: payload.game_duration_seconds,
            ..Self::default()
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct RoundStartPayload {
    #[serde(default)]
    pub round_type: Option<RoundType>,
    pub current_round: u32,
    #[serde(default)]
    pub total_rounds: Option<u32>,
    pub batch_size: u32,
    #[serde(default)]
    pub players: Option<Vec<String>>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub player_coins: IndexMap<String, Vec<bool>>,
    #[serde(default)]
    pub total_completed: u32,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub player_timers: IndexMap<String, TimerDto>,
    #[serde(default)]
    pub game_duration_seconds: Option<f64>,
    #[serde(default, with = "crate::dto::timestamp")]
    pub started_at: Option<OffsetDateTime>,
}

impl From<&RoundStartPayload> for GameSnapshotDto {
    fn from(payload: &RoundStartPayload) -> Self {
        Self {
            players: payload.players.clone(),
            state: Some(Phase::Active),
            round_type: payload.round_type,
            current_round: Some(payload.current_round),
            total_rounds: payload.total_rounds,
            batch_size: Some(payload.batch_size),
            player_coins: Some(payload.player_coins.clone()),
            total_completed: Some(payload.total_completed),
            player_timers: Some(payload.player_timers.clone()),
            game_duration_seconds: payload.game_duration_seconds,
            started_at: payload.started_at,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoundCompletePayload {
    pub round_number: u32,
    #[serde(default)]
    pub next_round: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub round_result: Option<RoundResultDto>,
    #[serde(default)]
    pub game_over: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameOverPayload {
    #[serde(default)]
    pub final_state: GameSnapshotDto,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct GameResetPayload {
    #[serde(default)]
    pub round_type: Option<RoundType>,
    #[serde(default)]
    pub required_players: Option<u32>,
    #[serde(default)]
    pub selected_batch_size: Option<u32>,
    #[serde(default)]
    pub current_round: u32,
    #[serde(default)]
    pub state: Option<Phase>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub player_coins: IndexMap<String, Vec<bool>>,
    #[serde(default)]
    pub total_completed: u32,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub player_timers: IndexMap<String, TimerDto>,
}

impl From<&GameResetPayload> for GameSnapshotDto {
    fn from(payload: &GameResetPayload) -> Self {
        Self {
            state: Some(payload.state.unwrap_or(Phase::Lobby)),
            round_type: payload.round_type,
            required_players: payload.required_players,
            selected_batch_size: Some(payload.selected_batch_size),
            current_round: Some(payload.current_round),
            player_coins: Some(payload.player_coins.clone()),
            total_completed: Some(payload.total_completed),
            player_timers: Some(payload.player_timers.clone()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoundConfigPayload {
    pub round_type: RoundType,
    #[serde(default)]
    pub required_players: Option<u32>,
    #[serde(default)]
    pub selected_batch_size: Option<u32>,
    #[serde(default)]
    pub total_rounds: Option<u32>,
}

impl From<&RoundConfigPayload> for GameSnapshotDto {
    /// Configuration fields only; coins are never touched by a config update.
    fn from(payload: &RoundConfigPayload) -> Self {
        Self {
            round_type: Some(payload.round_type),
            required_players: payload.required_players,
            selected_batch_size: Some(payload.selected_batch_size),
            total_rounds: payload.total_rounds,
            ..Self::default()
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct ActivityPayload {
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub players: Vec<String>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub spectators: Vec<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub activity: IndexMap<String, bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserJoinedPayload {
    pub username: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub players: Option<Vec<String>>,
    #[serde(default)]
    pub spectators: Option<Vec<String>>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresencePayload {
    pub username: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_frame() {
        let frame = InboundFrame::decode(
            r#"{"type": "round_complete", "round_number": 2, "game_over": false}"#,
        )
        .unwrap();
        assert_eq!(frame.kind, "round_complete");
        match frame.message {
            ServerMessage::RoundComplete(payload) => {
                assert_eq!(payload.round_number, 2);
                assert!(payload.round_result.is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unknown_discriminant_maps_to_unknown() {
        let frame = InboundFrame::decode(r#"{"type": "confetti", "amount": 3}"#).unwrap();
        assert_eq!(frame.kind, "confetti");
        assert!(matches!(frame.message, ServerMessage::Unknown));
    }

    #[test]
    fn malformed_frames_are_reported() {
        assert!(matches!(
            InboundFrame::decode("{not json"),
            Err(DecodeError::Json { .. })
        ));
        assert!(matches!(
            InboundFrame::decode(r#"{"round_number": 1}"#),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(
            InboundFrame::decode(r#"{"type": "action_made", "player": "ada"}"#),
            Err(DecodeError::Payload { ref kind, .. }) if kind == "action_made"
        ));
    }

    #[test]
    fn action_made_snapshot_never_carries_phase() {
        let frame = InboundFrame::decode(
            r#"{"type": "action_made", "player": "ada", "action": "flip", "coin_index": 0,
                "player_coins": {"ada": [true, false]}, "total_completed": 0,
                "state": "round_complete", "player_timers": null}"#,
        )
        .unwrap();
        let ServerMessage::ActionMade(payload) = frame.message else {
            panic!("expected action_made");
        };
        let snapshot = GameSnapshotDto::from(&payload);
        assert!(snapshot.state.is_none());
        assert!(snapshot.player_timers.is_none());
        assert_eq!(snapshot.player_coins.unwrap()["ada"], vec![true, false]);
    }
}
