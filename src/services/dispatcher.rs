//! Routes every inbound notification to exactly one handler. Each frame is
//! fully processed before the next; a bad frame is reported and skipped.

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    dto::{
        game::GameSnapshotDto,
        ws::{
            ActionKind, ActionMadePayload, ActivityPayload, GameOverPayload, GameResetPayload,
            InboundFrame, PhaseNoticePayload, PresencePayload, RoundCompletePayload,
            RoundConfigPayload, RoundStartPayload, ServerMessage, UserJoinedPayload,
            WelcomePayload,
        },
    },
    error::DecodeError,
    state::{
        SharedSession, StateUpdate,
        game::{GameState, LeadTimeMarks, Timer},
        signals::{Advisory, SessionSignal},
        state_machine::PhaseEvent,
        stats::RoundResult,
    },
};

/// Decode and dispatch one text frame. Decode failures are logged and
/// surfaced as an advisory; the caller keeps reading.
pub async fn dispatch_text(session: &SharedSession, text: &str) -> Result<(), DecodeError> {
    match InboundFrame::decode(text) {
        Ok(frame) => {
            debug!(kind = %frame.kind, "dispatching frame");
            dispatch(session, frame.message).await;
            Ok(())
        }
        Err(err) => {
            warn!(error = %err, "dropping malformed frame");
            session.notify(Advisory::warning(format!("Ignored a malformed update: {err}")));
            Err(err)
        }
    }
}

/// Route a decoded message to its handler.
pub async fn dispatch(session: &SharedSession, message: ServerMessage) {
    match message {
        ServerMessage::Welcome(payload) => handle_welcome(session, payload).await,
        ServerMessage::GameState(payload) => handle_game_state(session, payload).await,
        ServerMessage::ActionMade(payload) => handle_action_made(session, payload).await,
        ServerMessage::GameStarted(payload) | ServerMessage::RoundStarted(payload) => {
            handle_round_started(session, payload).await
        }
        ServerMessage::RoundComplete(payload) => handle_round_complete(session, payload).await,
        ServerMessage::GameOver(payload) => handle_game_over(session, payload).await,
        ServerMessage::GameReset(payload) => handle_game_reset(session, payload).await,
        ServerMessage::RoundConfigUpdate(payload) => handle_round_config(session, payload).await,
        ServerMessage::Activity(payload) => handle_activity(session, payload).await,
        ServerMessage::UserJoined(payload) => handle_user_joined(session, payload).await,
        ServerMessage::UserConnected(payload) | ServerMessage::UserReconnected(payload) => {
            handle_presence(session, payload, true).await
        }
        ServerMessage::UserDisconnected(payload) => handle_presence(session, payload, false).await,
        ServerMessage::HostDisconnected(payload) => handle_host_disconnected(session, payload).await,
        ServerMessage::Unknown => debug!("ignoring unknown notification"),
    }
}

async fn handle_welcome(session: &SharedSession, payload: WelcomePayload) {
    if let Some(username) = payload.username.as_deref() {
        if username != session.username() {
            warn!(username, expected = session.username(), "welcome addressed to someone else");
        }
    }
    let snapshot = payload.game_state;
    let room_id = payload.room_id;
    session
        .update_state(StateUpdate::replace(None), |current| {
            let mut next = current.merged(&snapshot);
            if room_id.is_some() {
                next.room_id = room_id;
            }
            next
        })
        .await;
    ingest_reported_rounds(session, &snapshot).await;
    info!(room = session.room_id(), "welcome received");
}

async fn handle_game_state(session: &SharedSession, payload: PhaseNoticePayload) {
    let event = PhaseEvent::Observed(payload.state);
    match payload.snapshot {
        Some(snapshot) => {
            session
                .update_state(StateUpdate::transition(event), |current| current.merged(&snapshot))
                .await;
        }
        None => {
            session
                .update_state(StateUpdate::transition(event), GameState::clone)
                .await;
        }
    }
}

async fn handle_action_made(session: &SharedSession, payload: ActionMadePayload) {
    let snapshot = GameSnapshotDto::from(&payload);
    let now = OffsetDateTime::now_utc();
    session
        .update_state(StateUpdate::reconcile(), |current| {
            let mut next = current.merged(&snapshot);
            if payload.action == ActionKind::Flip && next.lead_time.first_flip_at.is_none() {
                next.lead_time.first_flip_at = Some(now);
            }
            if current.total_completed == 0
                && next.total_completed > 0
                && next.lead_time.first_delivery_at.is_none()
            {
                next.lead_time.first_delivery_at = Some(now);
            }
            next
        })
        .await;
    debug!(
        player = %payload.player,
        action = ?payload.action,
        coin = ?payload.coin_index,
        batch = ?payload.batch_count,
        round_complete = payload.round_complete,
        game_over = payload.game_over,
        "action applied"
    );
}

async fn handle_round_started(session: &SharedSession, payload: RoundStartPayload) {
    let snapshot = GameSnapshotDto::from(&payload);
    let started_at = payload.started_at.unwrap_or_else(OffsetDateTime::now_utc);
    session
        .update_state(
            StateUpdate::replace(Some(PhaseEvent::RoundStarted)),
            |current| {
                let fresh = GameState {
                    game_timer: Timer {
                        started_at: Some(started_at),
                        ..Timer::default()
                    },
                    lead_time: LeadTimeMarks::default(),
                    ..current.clone()
                };
                fresh.merged(&snapshot)
            },
        )
        .await;
    info!(round = payload.current_round, batch = payload.batch_size, "round started");
}

async fn handle_round_complete(session: &SharedSession, payload: RoundCompletePayload) {
    let event = if payload.game_over {
        PhaseEvent::GameOver
    } else {
        PhaseEvent::RoundCompleted
    };
    let round = payload.round_number;
    let ended_at = payload
        .round_result
        .as_ref()
        .and_then(|result| result.ended_at)
        .unwrap_or_else(OffsetDateTime::now_utc);
    let reported_duration = payload
        .round_result
        .as_ref()
        .and_then(|result| result.game_duration_seconds);

    session
        .update_state(StateUpdate::transition(event), |current| {
            let mut next = current.clone();
            if next.current_round == round && next.game_timer.ended_at.is_none() {
                next.game_timer.ended_at = Some(ended_at);
            }
            if next.current_round == round && reported_duration.is_some() {
                next.game_timer.duration_seconds = reported_duration;
            }
            if let Some(batch) = payload.batch_size {
                if next.current_round == round {
                    next.batch_size = batch;
                }
            }
            next
        })
        .await;

    match payload.round_result {
        Some(result) => {
            session.record_round(result, round).await;
        }
        None => {
            warn!(round, "round_complete without a result; extracting from live state");
            let live = session.game_state().await;
            if live.current_round == round {
                session.insert_round(RoundResult::from_live(&live)).await;
            }
        }
    }

    if payload.game_over {
        session.ensure_rounds().await;
        session.emit(SessionSignal::GameFinished);
    }
    info!(round, next = ?payload.next_round, game_over = payload.game_over, "round complete");
}

async fn handle_game_over(session: &SharedSession, payload: GameOverPayload) {
    let snapshot = payload.final_state;
    session
        .update_state(
            StateUpdate::replace(Some(PhaseEvent::GameOver)),
            |current| {
                let mut next = current.merged(&snapshot);
                if next.game_timer.started_at.is_some() && next.game_timer.ended_at.is_none() {
                    next.game_timer.ended_at = Some(OffsetDateTime::now_utc());
                }
                next
            },
        )
        .await;
    ingest_reported_rounds(session, &snapshot).await;
    let report = session.ensure_rounds().await;
    session.emit(SessionSignal::GameFinished);
    info!(
        extracted = ?report.extracted,
        placeholders = report.placeholders.len(),
        "game over"
    );
}

async fn ingest_reported_rounds(session: &SharedSession, snapshot: &GameSnapshotDto) {
    for (position, result) in snapshot.round_results.iter().enumerate() {
        let fallback = u32::try_from(position + 1).unwrap_or(u32::MAX);
        session.record_round(result.clone(), fallback).await;
    }
}

async fn handle_game_reset(session: &SharedSession, payload: GameResetPayload) {
    let snapshot = GameSnapshotDto::from(&payload);
    let pending = session.guard().clear();
    session.reset_state(&snapshot).await;
    session.clear_stats().await;
    info!(pending, "game reset");
}

async fn handle_round_config(session: &SharedSession, payload: RoundConfigPayload) {
    let snapshot = GameSnapshotDto::from(&payload);
    session
        .update_state(StateUpdate::reconcile(), |current| current.merged(&snapshot))
        .await;
    session.clear_stats().await;
    info!(round_type = ?payload.round_type, "round configuration updated");
}

async fn handle_activity(session: &SharedSession, payload: ActivityPayload) {
    let roster = GameSnapshotDto {
        players: Some(payload.players),
        spectators: Some(payload.spectators),
        host: Some(payload.host),
        ..GameSnapshotDto::default()
    };
    let unchanged = session
        .read_state(|current| current.merged(&roster) == *current)
        .await;
    if !unchanged {
        session
            .update_state(StateUpdate::reconcile(), |current| current.merged(&roster))
            .await;
    }
    session.replace_presence(payload.activity).await;
}

async fn handle_user_joined(session: &SharedSession, payload: UserJoinedPayload) {
    let roster = GameSnapshotDto {
        players: payload.players,
        spectators: payload.spectators,
        ..GameSnapshotDto::default()
    };
    session
        .update_state(StateUpdate::reconcile(), |current| current.merged(&roster))
        .await;
    session.set_online(&payload.username, true).await;
    if let Some(note) = payload.note {
        session.notify(Advisory::info(format!("{}: {note}", payload.username)));
    }
    info!(username = %payload.username, role = ?payload.role, "user joined");
}

async fn handle_presence(session: &SharedSession, payload: PresencePayload, online: bool) {
    if session.set_online(&payload.username, online).await {
        debug!(username = %payload.username, online, "presence changed");
    }
}

async fn handle_host_disconnected(session: &SharedSession, payload: PresencePayload) {
    session.set_online(&payload.username, false).await;
    let message = payload
        .message
        .unwrap_or_else(|| format!("Host {} disconnected; the room is closed", payload.username));
    session.close(&message).await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::future::BoxFuture;

    use super::*;
    use crate::{
        dto::requests::{
            ChangeRoleRequest, FlipRequest, JoinRequest, RoundConfigRequest, SendRequest,
        },
        services::api::{ApiResult, ServerApi},
        state::{GameSession, NoopRenderer, SessionOptions, state_machine::Phase},
    };

    struct OfflineApi;

    impl ServerApi for OfflineApi {
        fn create_room(&self) -> BoxFuture<'static, ApiResult<String>> {
            Box::pin(async { Ok("ROOM".to_string()) })
        }
        fn join_room(
            &self,
            _room_id: &str,
            _request: JoinRequest,
            _spectator: bool,
        ) -> BoxFuture<'static, ApiResult<GameSnapshotDto>> {
            Box::pin(async { Ok(GameSnapshotDto::default()) })
        }
        fn change_role(
            &self,
            _room_id: &str,
            _request: ChangeRoleRequest,
        ) -> BoxFuture<'static, ApiResult<()>> {
            Box::pin(async { Ok(()) })
        }
        fn configure_rounds(
            &self,
            _room_id: &str,
            _request: RoundConfigRequest,
        ) -> BoxFuture<'static, ApiResult<()>> {
            Box::pin(async { Ok(()) })
        }
        fn start_game(&self, _room_id: &str) -> BoxFuture<'static, ApiResult<()>> {
            Box::pin(async { Ok(()) })
        }
        fn next_round(&self, _room_id: &str) -> BoxFuture<'static, ApiResult<()>> {
            Box::pin(async { Ok(()) })
        }
        fn reset_game(&self, _room_id: &str) -> BoxFuture<'static, ApiResult<()>> {
            Box::pin(async { Ok(()) })
        }
        fn flip_coin(
            &self,
            _room_id: &str,
            _request: FlipRequest,
        ) -> BoxFuture<'static, ApiResult<()>> {
            Box::pin(async { Ok(()) })
        }
        fn send_batch(
            &self,
            _room_id: &str,
            _request: SendRequest,
        ) -> BoxFuture<'static, ApiResult<()>> {
            Box::pin(async { Ok(()) })
        }
        fn fetch_state(&self, _room_id: &str) -> BoxFuture<'static, ApiResult<GameSnapshotDto>> {
            Box::pin(async { Ok(GameSnapshotDto::default()) })
        }
    }

    fn session() -> SharedSession {
        GameSession::new(
            "ROOM",
            "ada",
            SessionOptions::default(),
            Arc::new(OfflineApi),
            Arc::new(NoopRenderer),
        )
    }

    #[tokio::test]
    async fn malformed_frame_does_not_stop_processing() {
        let session = session();
        assert!(dispatch_text(&session, "{oops").await.is_err());
        dispatch_text(
            &session,
            r#"{"type": "welcome", "room_id": "ROOM", "username": "ada",
                "game_state": {"players": ["ada", "bob"], "host": "eve", "state": "lobby"}}"#,
        )
        .await
        .unwrap();
        assert_eq!(session.game_state().await.players, vec!["ada", "bob"]);
    }

    #[tokio::test]
    async fn unknown_frames_leave_state_untouched() {
        let session = session();
        let before = session.game_state().await;
        dispatch_text(&session, r#"{"type": "confetti"}"#).await.unwrap();
        assert_eq!(session.game_state().await, before);
    }

    #[tokio::test]
    async fn config_update_never_touches_coins() {
        let session = session();
        dispatch_text(
            &session,
            r#"{"type": "welcome", "game_state": {"players": ["ada"], "state": "active",
                "player_coins": {"ada": [true, false]}, "total_completed": 13}}"#,
        )
        .await
        .unwrap();
        dispatch_text(
            &session,
            r#"{"type": "round_config_update", "round_type": "single",
                "required_players": 2, "selected_batch_size": 5}"#,
        )
        .await
        .unwrap();

        let state = session.game_state().await;
        assert_eq!(state.player_coins["ada"], vec![true, false]);
        assert_eq!(state.total_rounds, 1);
        assert_eq!(state.selected_batch_size, Some(5));
    }

    #[tokio::test]
    async fn host_disconnect_closes_the_room() {
        let session = session();
        let mut signals = session.subscribe();
        dispatch_text(
            &session,
            r#"{"type": "host_disconnected", "username": "eve", "message": "Host left"}"#,
        )
        .await
        .unwrap();
        assert!(session.is_closed());
        let mut saw_notice = false;
        while let Ok(signal) = signals.try_recv() {
            if let SessionSignal::Notice(advisory) = signal {
                saw_notice |= advisory.message == "Host left";
            }
        }
        assert!(saw_notice);
    }

    #[tokio::test]
    async fn action_made_keeps_phase_and_stamps_lead_marks() {
        let session = session();
        dispatch_text(
            &session,
            r#"{"type": "round_started", "current_round": 1, "batch_size": 15,
                "players": ["ada", "bob"],
                "player_coins": {"ada": [false, false], "bob": []}, "total_completed": 0}"#,
        )
        .await
        .unwrap();
        assert_eq!(session.game_state().await.total_coins, 2);

        dispatch_text(
            &session,
            r#"{"type": "action_made", "player": "ada", "action": "flip", "coin_index": 0,
                "player_coins": {"ada": [true, false], "bob": []}, "total_completed": 0,
                "state": "results"}"#,
        )
        .await
        .unwrap();

        let state = session.game_state().await;
        assert_eq!(state.phase, Phase::Active);
        assert_eq!(state.player_coins["ada"], vec![true, false]);
        assert!(state.lead_time.first_flip_at.is_some());
        assert!(state.lead_time.first_delivery_at.is_none());
        assert!(state.game_timer.started_at.is_some());
    }
}
