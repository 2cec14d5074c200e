//! Locally initiated actions. Each one checks phase and role, raises its
//! pending flag, sends one request and never mutates state directly: the
//! server's push re-enters the inbound pipeline.

use std::future::Future;

use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};
use validator::Validate;

use crate::{
    dto::requests::{
        ChangeRoleRequest, FlipRequest, JoinRequest, RoleRequest, RoundConfigRequest, SendRequest,
    },
    error::{ActionError, HoldError},
    services::api::ApiResult,
    state::{
        SharedSession, StateUpdate,
        guard::ActionClass,
        holds::CoinRef,
        signals::{Advisory, SessionSignal},
        state_machine::{LocalAction, permits},
    },
};

/// Refuse `action` unless the room is open and the phase and role allow it.
async fn ensure_permitted(session: &SharedSession, action: LocalAction) -> Result<(), ActionError> {
    if session.is_closed() {
        return Err(ActionError::Closed);
    }
    let phase = session.phase().await;
    let role = session.role().await;
    if permits(phase, role, action) {
        Ok(())
    } else {
        Err(ActionError::NotPermitted {
            action,
            reason: format!("{role:?} cannot do this while the room is {phase:?}"),
        })
    }
}

/// Run `request` under the pending flag for `class` and the request timeout.
/// The flag is released on every path; failures become advisories.
async fn run_guarded<F, Fut, T>(
    session: &SharedSession,
    class: ActionClass,
    label: &'static str,
    request: F,
) -> Result<T, ActionError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ApiResult<T>>,
{
    if session.is_closed() {
        return Err(ActionError::Closed);
    }
    let Some(scope) = session.guard().scoped(class) else {
        debug!(?class, "dropping duplicate request");
        return Err(ActionError::Busy(class));
    };

    let outcome = match timeout(session.options().request_timeout, request()).await {
        Ok(result) => result.map_err(ActionError::from),
        Err(_) => Err(ActionError::Timeout),
    };
    drop(scope);

    if let Err(err) = &outcome {
        warn!(action = label, error = %err, "request failed");
        let message = match err {
            ActionError::Request(api) => format!("Could not {label}: {}", api.user_message()),
            other => format!("Could not {label}: {other}"),
        };
        session.notify(Advisory::error(message));
    }
    outcome
}

/// Join the session's room and land the returned snapshot.
pub async fn join_room(session: &SharedSession, spectator: bool) -> Result<(), ActionError> {
    let request = JoinRequest {
        username: session.username().to_string(),
    };
    request.validate()?;

    let api = session.api();
    let room_id = session.room_id().to_string();
    let snapshot = run_guarded(session, ActionClass::Join, "join the room", move || {
        api.join_room(&room_id, request, spectator)
    })
    .await?;

    session
        .update_state(StateUpdate::replace(None), |current| current.merged(&snapshot))
        .await;
    info!(room = session.room_id(), spectator, "joined room");
    Ok(())
}

/// Host: move `username` between players and spectators.
pub async fn change_role(
    session: &SharedSession,
    username: &str,
    role: RoleRequest,
) -> Result<(), ActionError> {
    ensure_permitted(session, LocalAction::ChangeRole).await?;
    let request = ChangeRoleRequest {
        username: username.to_string(),
        role,
    };
    request.validate()?;

    let api = session.api();
    let room_id = session.room_id().to_string();
    run_guarded(session, ActionClass::ChangeRole, "change role", move || {
        api.change_role(&room_id, request)
    })
    .await
}

/// Host: choose the round structure.
pub async fn configure_rounds(
    session: &SharedSession,
    request: RoundConfigRequest,
) -> Result<(), ActionError> {
    ensure_permitted(session, LocalAction::ConfigureRounds).await?;
    request.validate()?;

    let api = session.api();
    let room_id = session.room_id().to_string();
    run_guarded(
        session,
        ActionClass::ConfigureRounds,
        "configure rounds",
        move || api.configure_rounds(&room_id, request),
    )
    .await
}

/// Host: start the first round.
pub async fn start_game(session: &SharedSession) -> Result<(), ActionError> {
    ensure_permitted(session, LocalAction::StartGame).await?;
    let api = session.api();
    let room_id = session.room_id().to_string();
    run_guarded(session, ActionClass::StartGame, "start the game", move || {
        api.start_game(&room_id)
    })
    .await
}

/// Host: start the next round after a round completes.
pub async fn next_round(session: &SharedSession) -> Result<(), ActionError> {
    ensure_permitted(session, LocalAction::NextRound).await?;
    let api = session.api();
    let room_id = session.room_id().to_string();
    run_guarded(session, ActionClass::NextRound, "start the next round", move || {
        api.next_round(&room_id)
    })
    .await
}

/// Host: send the room back to the lobby.
pub async fn reset_game(session: &SharedSession) -> Result<(), ActionError> {
    ensure_permitted(session, LocalAction::ResetGame).await?;
    let api = session.api();
    let room_id = session.room_id().to_string();
    run_guarded(session, ActionClass::ResetGame, "reset the game", move || {
        api.reset_game(&room_id)
    })
    .await
}

/// Host: reset and immediately start a fresh game with the same players.
pub async fn restart_game(session: &SharedSession) -> Result<(), ActionError> {
    ensure_permitted(session, LocalAction::ResetGame).await?;
    let api = session.api();
    let room_id = session.room_id().to_string();
    run_guarded(session, ActionClass::ResetGame, "restart the game", move || async move {
        api.reset_game(&room_id).await?;
        api.start_game(&room_id).await
    })
    .await
}

/// Forward the local station's flipped coins downstream.
pub async fn send_batch(session: &SharedSession) -> Result<(), ActionError> {
    ensure_permitted(session, LocalAction::SendBatch).await?;
    let username = session.username().to_string();
    if !session.read_state(|state| state.can_send_batch(&username)).await {
        return Err(ActionError::NotPermitted {
            action: LocalAction::SendBatch,
            reason: "not enough flipped coins for a batch".into(),
        });
    }
    let request = SendRequest { username };
    request.validate()?;

    let api = session.api();
    let room_id = session.room_id().to_string();
    run_guarded(session, ActionClass::SendBatch, "send the batch", move || {
        api.send_batch(&room_id, request)
    })
    .await
}

/// Flip the local coin at `index` immediately, without a hold gesture.
pub async fn flip_coin(session: &SharedSession, index: usize) -> Result<(), ActionError> {
    ensure_permitted(session, LocalAction::FlipCoin).await?;
    let coin = CoinRef::new(session.username(), index);
    ensure_tails(session, &coin)
        .await
        .map_err(|err| ActionError::InvalidInput(err.to_string()))?;
    {
        let mut holds = session.holds().lock().await;
        if holds.stage(&coin).is_some() || !holds.mark_optimistic(coin.clone()) {
            return Err(ActionError::Busy(ActionClass::FlipCoin(index)));
        }
    }
    submit_flip(session, coin).await
}

/// Send the flip request for `coin`, reverting its optimistic flip on failure.
async fn submit_flip(session: &SharedSession, coin: CoinRef) -> Result<(), ActionError> {
    let request = FlipRequest {
        username: coin.player.clone(),
        coin_index: coin.index,
    };
    let outcome = match request.validate() {
        Ok(()) => {
            let api = session.api();
            let room_id = session.room_id().to_string();
            run_guarded(
                session,
                ActionClass::FlipCoin(coin.index),
                "flip the coin",
                move || api.flip_coin(&room_id, request),
            )
            .await
        }
        Err(err) => Err(err.into()),
    };

    if outcome.is_err() && session.holds().lock().await.revert(&coin) {
        session.emit(SessionSignal::FlipReverted { coin });
    }
    outcome
}

async fn ensure_tails(session: &SharedSession, coin: &CoinRef) -> Result<(), HoldError> {
    match session
        .read_state(|state| state.coin(&coin.player, coin.index))
        .await
    {
        Some(false) => Ok(()),
        _ => Err(HoldError::NoSuchCoin { index: coin.index }),
    }
}

/// Start a press-and-hold on the local coin at `index`. The flip is sent
/// once the hold threshold elapses unless [`cancel_hold`] runs first.
pub async fn begin_hold(session: &SharedSession, index: usize) -> Result<(), HoldError> {
    if session.is_closed() {
        return Err(HoldError::NotPermitted);
    }
    let phase = session.phase().await;
    if !permits(phase, session.role().await, LocalAction::FlipCoin) {
        return Err(HoldError::NotPermitted);
    }
    let coin = CoinRef::new(session.username(), index);
    ensure_tails(session, &coin).await?;

    let threshold = session.options().hold_threshold;
    let mut holds = session.holds().lock().await;
    let generation = holds.begin(coin.clone(), threshold)?;

    let task_session = session.clone();
    let task_coin = coin.clone();
    let task = tokio::spawn(async move {
        sleep(threshold).await;
        commit_hold(&task_session, task_coin, generation).await;
    });
    holds.attach(&coin, generation, task.abort_handle());
    debug!(index, "hold started");
    Ok(())
}

async fn commit_hold(session: &SharedSession, coin: CoinRef, generation: u64) {
    if !session.holds().lock().await.commit(&coin, generation) {
        return;
    }
    info!(index = coin.index, "hold committed");
    if let Err(err) = submit_flip(session, coin).await {
        debug!(error = %err, "committed flip failed");
    }
}

/// Release a hold before it commits. The coin is left exactly as it was.
pub async fn cancel_hold(session: &SharedSession, index: usize) -> bool {
    let coin = CoinRef::new(session.username(), index);
    session.holds().lock().await.cancel(&coin)
}

/// Progress of the hold on the local coin at `index`, in `0.0..=1.0`.
pub async fn hold_progress(session: &SharedSession, index: usize) -> Option<f64> {
    let coin = CoinRef::new(session.username(), index);
    session.holds().lock().await.progress(&coin, Instant::now())
}

/// Fetch the authoritative state and land it as a full replace.
pub async fn resync(session: &SharedSession) -> Result<(), ActionError> {
    let api = session.api();
    let room_id = session.room_id().to_string();
    let snapshot = api
        .fetch_state(&room_id)
        .await
        .map_err(ActionError::from)?;
    session
        .update_state(StateUpdate::replace(None), |current| current.merged(&snapshot))
        .await;
    info!(room = session.room_id(), "resynchronised with server");
    Ok(())
}

