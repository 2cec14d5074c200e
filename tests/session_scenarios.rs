use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use penny_flow_client::{
    dto::{
        game::GameSnapshotDto,
        requests::{ChangeRoleRequest, FlipRequest, JoinRequest, RoundConfigRequest, SendRequest},
    },
    error::{ActionError, HoldError},
    services::{
        actions,
        api::{ApiError, ApiResult, ServerApi},
        dispatcher,
    },
    state::{
        GameSession, NoopRenderer, SessionOptions, SharedSession,
        game::Role,
        guard::ActionClass,
        holds::CoinRef,
        signals::{NoticeLevel, SessionSignal},
        state_machine::Phase,
        stats::ResultSource,
        store::{ApplyMode, ReplaceReason},
    },
};
use serde_json::json;
use tokio::sync::{Notify, broadcast};

#[derive(Default)]
struct MockApi {
    calls: Mutex<Vec<&'static str>>,
    fail_flips: AtomicBool,
    start_gate: Option<Arc<Notify>>,
    join_snapshot: GameSnapshotDto,
}

impl MockApi {
    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn count(&self, call: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|recorded| **recorded == call)
            .count()
    }
}

fn ok() -> BoxFuture<'static, ApiResult<()>> {
    Box::pin(async { Ok(()) })
}

impl ServerApi for MockApi {
    fn create_room(&self) -> BoxFuture<'static, ApiResult<String>> {
        self.record("create");
        Box::pin(async { Ok("ROOM".to_string()) })
    }

    fn join_room(
        &self,
        _room_id: &str,
        _request: JoinRequest,
        _spectator: bool,
    ) -> BoxFuture<'static, ApiResult<GameSnapshotDto>> {
        self.record("join");
        let snapshot = self.join_snapshot.clone();
        Box::pin(async move { Ok(snapshot) })
    }

    fn change_role(
        &self,
        _room_id: &str,
        _request: ChangeRoleRequest,
    ) -> BoxFuture<'static, ApiResult<()>> {
        self.record("change_role");
        ok()
    }

    fn configure_rounds(
        &self,
        _room_id: &str,
        _request: RoundConfigRequest,
    ) -> BoxFuture<'static, ApiResult<()>> {
        self.record("round_config");
        ok()
    }

    fn start_game(&self, _room_id: &str) -> BoxFuture<'static, ApiResult<()>> {
        self.record("start");
        let gate = self.start_gate.clone();
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            Ok(())
        })
    }

    fn next_round(&self, _room_id: &str) -> BoxFuture<'static, ApiResult<()>> {
        self.record("next_round");
        ok()
    }

    fn reset_game(&self, _room_id: &str) -> BoxFuture<'static, ApiResult<()>> {
        self.record("reset");
        ok()
    }

    fn flip_coin(&self, _room_id: &str, _request: FlipRequest) -> BoxFuture<'static, ApiResult<()>> {
        self.record("flip");
        let fail = self.fail_flips.load(Ordering::SeqCst);
        Box::pin(async move {
            if fail {
                Err(ApiError::RequestStatus {
                    path: "game/flip/ROOM".into(),
                    status: 400,
                    detail: "Coin already flipped".into(),
                })
            } else {
                Ok(())
            }
        })
    }

    fn send_batch(&self, _room_id: &str, _request: SendRequest) -> BoxFuture<'static, ApiResult<()>> {
        self.record("send");
        ok()
    }

    fn fetch_state(&self, _room_id: &str) -> BoxFuture<'static, ApiResult<GameSnapshotDto>> {
        self.record("state");
        Box::pin(async { Ok(GameSnapshotDto::default()) })
    }
}

fn session_with(api: Arc<MockApi>) -> SharedSession {
    GameSession::new(
        "ROOM",
        "ada",
        SessionOptions::default(),
        api,
        Arc::new(NoopRenderer),
    )
}

async fn feed(session: &SharedSession, frame: &str) {
    dispatcher::dispatch_text(session, frame)
        .await
        .expect("frame should decode");
}

fn drain(signals: &mut broadcast::Receiver<SessionSignal>) -> Vec<SessionSignal> {
    let mut seen = Vec::new();
    while let Ok(signal) = signals.try_recv() {
        seen.push(signal);
    }
    seen
}

fn welcome(host: &str) -> String {
    json!({
        "type": "welcome",
        "room_id": "ROOM",
        "username": "ada",
        "game_state": {
            "players": ["ada", "bob"],
            "spectators": [],
            "host": host,
            "state": "lobby",
            "round_type": "three_rounds",
            "total_rounds": 3
        }
    })
    .to_string()
}

fn round_started(kind: &str, round: u32, batch: u32, started_at: Option<&str>) -> String {
    json!({
        "type": kind,
        "current_round": round,
        "total_rounds": 3,
        "batch_size": batch,
        "players": ["ada", "bob"],
        "player_coins": {"ada": vec![false; 15], "bob": []},
        "total_completed": 0,
        "player_timers": {},
        "started_at": started_at
    })
    .to_string()
}

fn action_made(heads: &[usize]) -> String {
    let mut coins = vec![false; 15];
    for index in heads {
        coins[*index] = true;
    }
    json!({
        "type": "action_made",
        "player": "ada",
        "action": "flip",
        "coin_index": heads.last(),
        "player_coins": {"ada": coins, "bob": []},
        "total_completed": 0
    })
    .to_string()
}

async fn active_player(api: Arc<MockApi>) -> SharedSession {
    let session = session_with(api);
    feed(&session, &welcome("eve")).await;
    feed(&session, &round_started("game_started", 1, 15, None)).await;
    assert_eq!(session.phase().await, Phase::Active);
    assert_eq!(session.role().await, Role::Player);
    session
}

#[tokio::test]
async fn join_lands_snapshot_and_derives_role() {
    let api = Arc::new(MockApi {
        join_snapshot: serde_json::from_value(json!({
            "players": ["ada"],
            "host": "eve",
            "state": "lobby"
        }))
        .unwrap(),
        ..MockApi::default()
    });
    let session = session_with(api.clone());

    actions::join_room(&session, false).await.unwrap();

    assert_eq!(api.count("join"), 1);
    assert_eq!(session.role().await, Role::Player);
    let state = session.game_state().await;
    assert_eq!(state.room_id.as_deref(), Some("ROOM"));
    assert_eq!(state.host.as_deref(), Some("eve"));
}

#[tokio::test]
async fn three_round_game_recovers_unreported_final_round() {
    let session = session_with(Arc::new(MockApi::default()));
    let mut signals = session.subscribe();

    feed(&session, &welcome("eve")).await;
    feed(&session, &round_started("game_started", 1, 15, None)).await;
    feed(
        &session,
        &json!({
            "type": "round_complete",
            "round_number": 1,
            "next_round": 2,
            "round_result": {
                "round_number": 1,
                "batch_size": 15,
                "game_duration_seconds": 60.0,
                "total_completed": 15,
                "player_timers": {
                    "ada": {"duration_seconds": 30.0},
                    "bob": {"duration_seconds": 25.0}
                }
            }
        })
        .to_string(),
    )
    .await;
    assert_eq!(session.phase().await, Phase::RoundComplete);

    feed(&session, &round_started("round_started", 2, 5, None)).await;
    feed(
        &session,
        &json!({
            "type": "round_complete",
            "round_number": 2,
            "next_round": 3,
            "round_result": {
                "round_number": 2,
                "batch_size": 5,
                "game_duration_seconds": 40.0,
                "total_completed": 15
            }
        })
        .to_string(),
    )
    .await;

    feed(
        &session,
        &round_started("round_started", 3, 1, Some("2024-01-01T00:00:00Z")),
    )
    .await;
    // The last round's round_complete never arrives; game_over carries the final state only.
    feed(
        &session,
        &json!({
            "type": "game_over",
            "final_state": {
                "state": "results",
                "current_round": 3,
                "total_completed": 15,
                "player_coins": {"ada": [], "bob": []},
                "ended_at": "2024-01-01T00:00:30Z"
            }
        })
        .to_string(),
    )
    .await;

    assert_eq!(session.phase().await, Phase::Results);
    let rounds = session.round_results().await;
    assert_eq!(rounds.len(), 3);
    assert_eq!(rounds[0].source, ResultSource::Reported);
    assert_eq!(rounds[1].batch_size, 5);
    assert_eq!(rounds[2].round_number, 3);
    assert_eq!(rounds[2].source, ResultSource::Extracted);
    assert_eq!(rounds[2].batch_size, 1);
    assert_eq!(rounds[2].game_duration_seconds, Some(30.0));
    assert_eq!(rounds[2].efficiency, 30.0);

    let summary = session.summary().await.expect("summary after a finished game");
    assert_eq!(summary.rounds_played, 3);
    assert_eq!(summary.incomplete_rounds, 0);
    assert_eq!(summary.total_game_time, 130.0);
    assert_eq!(summary.best_round_time, Some(30.0));
    assert_eq!(summary.worst_round_time, Some(60.0));
    assert_eq!(
        summary
            .batch_size_impact
            .iter()
            .map(|impact| impact.batch_size)
            .collect::<Vec<_>>(),
        vec![1, 5, 15]
    );
    assert_eq!(summary.player_summary["ada"].rounds_completed, 1);

    let seen = drain(&mut signals);
    assert!(seen.contains(&SessionSignal::GameFinished));
    assert!(seen.contains(&SessionSignal::PhaseChanged {
        from: Phase::Active,
        to: Phase::Results,
    }));
}

#[tokio::test]
async fn duplicate_activity_is_idempotent() {
    let session = session_with(Arc::new(MockApi::default()));
    feed(&session, &welcome("eve")).await;

    let activity = json!({
        "type": "activity",
        "players": ["ada", "bob"],
        "spectators": ["zed"],
        "host": "eve",
        "activity": {"ada": true, "bob": false, "eve": true}
    })
    .to_string();

    let mut signals = session.subscribe();
    feed(&session, &activity).await;
    assert!(!drain(&mut signals).is_empty());
    let after_first = session.game_state().await;

    feed(&session, &activity).await;
    assert!(drain(&mut signals).is_empty());
    assert_eq!(session.game_state().await, after_first);

    let presence = session.presence().await;
    assert!(presence.is_online("ada"));
    assert!(!presence.is_online("bob"));
    assert!(after_first.spectators.contains("zed"));
}

#[tokio::test(start_paused = true)]
async fn cancelled_hold_sends_nothing() {
    let api = Arc::new(MockApi::default());
    let session = active_player(api.clone()).await;
    let before = session.game_state().await;

    actions::begin_hold(&session, 0).await.unwrap();
    tokio::time::advance(Duration::from_millis(400)).await;
    let progress = actions::hold_progress(&session, 0).await.unwrap();
    assert!((progress - 0.5).abs() < 1e-6, "progress was {progress}");

    assert!(actions::cancel_hold(&session, 0).await);
    tokio::time::advance(Duration::from_secs(2)).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    assert_eq!(api.count("flip"), 0);
    assert_eq!(session.game_state().await, before);
    assert!(session.optimistic_flips().await.is_empty());
    assert!(actions::hold_progress(&session, 0).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn completed_hold_flips_exactly_once() {
    let api = Arc::new(MockApi::default());
    let session = active_player(api.clone()).await;

    actions::begin_hold(&session, 0).await.unwrap();
    assert_eq!(
        actions::begin_hold(&session, 0).await,
        Err(HoldError::AlreadyHolding { index: 0 })
    );

    tokio::time::advance(Duration::from_millis(850)).await;
    for _ in 0..20 {
        if api.count("flip") > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(api.count("flip"), 1);
    assert_eq!(
        session.optimistic_flips().await,
        vec![CoinRef::new("ada", 0)]
    );

    tokio::time::advance(Duration::from_secs(2)).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert_eq!(api.count("flip"), 1);

    feed(&session, &action_made(&[0])).await;
    assert!(session.optimistic_flips().await.is_empty());
    assert_eq!(
        actions::begin_hold(&session, 0).await,
        Err(HoldError::NoSuchCoin { index: 0 })
    );
}

#[tokio::test]
async fn failed_flip_reverts_optimistic_state() {
    let api = Arc::new(MockApi::default());
    api.fail_flips.store(true, Ordering::SeqCst);
    let session = active_player(api.clone()).await;
    let mut signals = session.subscribe();

    let outcome = actions::flip_coin(&session, 2).await;
    assert!(matches!(outcome, Err(ActionError::Request(_))));
    assert_eq!(api.count("flip"), 1);
    assert!(session.optimistic_flips().await.is_empty());
    assert!(!session.is_action_pending(ActionClass::FlipCoin(2)));

    let seen = drain(&mut signals);
    assert!(seen.contains(&SessionSignal::FlipReverted {
        coin: CoinRef::new("ada", 2)
    }));
    assert!(seen.iter().any(|signal| matches!(
        signal,
        SessionSignal::Notice(advisory)
            if advisory.level == NoticeLevel::Error
                && advisory.message.contains("Coin already flipped")
    )));
    assert_eq!(session.game_state().await.coin("ada", 2), Some(false));
}

#[tokio::test]
async fn concurrent_start_is_refused_while_pending() {
    let gate = Arc::new(Notify::new());
    let api = Arc::new(MockApi {
        start_gate: Some(gate.clone()),
        ..MockApi::default()
    });
    let session = session_with(api.clone());
    feed(&session, &welcome("ada")).await;
    assert_eq!(session.role().await, Role::Host);

    let first = tokio::spawn({
        let session = session.clone();
        async move { actions::start_game(&session).await }
    });
    for _ in 0..50 {
        if session.is_action_pending(ActionClass::StartGame) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(session.is_action_pending(ActionClass::StartGame));

    let second = actions::start_game(&session).await;
    assert!(matches!(
        second,
        Err(ActionError::Busy(ActionClass::StartGame))
    ));

    gate.notify_one();
    first.await.unwrap().unwrap();
    assert!(!session.is_action_pending(ActionClass::StartGame));
    assert_eq!(api.count("start"), 1);
}

#[tokio::test]
async fn players_cannot_use_host_actions() {
    let api = Arc::new(MockApi::default());
    let session = session_with(api.clone());
    feed(&session, &welcome("eve")).await;

    assert!(matches!(
        actions::start_game(&session).await,
        Err(ActionError::NotPermitted { .. })
    ));
    assert!(matches!(
        actions::flip_coin(&session, 0).await,
        Err(ActionError::NotPermitted { .. })
    ));
    assert_eq!(api.count("start"), 0);
    assert_eq!(api.count("flip"), 0);
}

#[tokio::test]
async fn malformed_frames_are_isolated() {
    let session = session_with(Arc::new(MockApi::default()));
    feed(&session, &welcome("eve")).await;

    assert!(dispatcher::dispatch_text(&session, "not json").await.is_err());
    assert!(
        dispatcher::dispatch_text(&session, r#"{"type": "action_made"}"#)
            .await
            .is_err()
    );
    feed(&session, &round_started("game_started", 1, 15, None)).await;

    let state = session.game_state().await;
    assert_eq!(state.phase, Phase::Active);
    assert_eq!(state.player_coins["ada"].len(), 15);
}

#[tokio::test]
async fn pending_action_forces_full_replace() {
    let session = active_player(Arc::new(MockApi::default())).await;
    let mut signals = session.subscribe();

    session
        .guard()
        .begin(ActionClass::SendBatch)
        .expect("guard is free");
    feed(&session, &action_made(&[0])).await;
    assert!(drain(&mut signals).contains(&SessionSignal::StateChanged {
        mode: ApplyMode::FullReplace(ReplaceReason::ActionPending),
    }));

    assert!(session.guard().end(ActionClass::SendBatch));
    feed(&session, &action_made(&[0, 1])).await;
    assert!(drain(&mut signals).contains(&SessionSignal::StateChanged {
        mode: ApplyMode::Incremental,
    }));
    assert_eq!(session.game_state().await.heads_count("ada"), 2);
}

#[tokio::test]
async fn rooms_with_fewer_coins_still_patch_incrementally() {
    let session = session_with(Arc::new(MockApi::default()));
    let mut signals = session.subscribe();
    feed(&session, &welcome("eve")).await;

    let coins = |heads: usize| {
        let mut coins = vec![false; 12];
        coins[..heads].fill(true);
        coins
    };
    feed(
        &session,
        &json!({
            "type": "game_started",
            "current_round": 1,
            "total_rounds": 3,
            "batch_size": 5,
            "players": ["ada", "bob"],
            "player_coins": {"ada": coins(0), "bob": []},
            "total_completed": 0
        })
        .to_string(),
    )
    .await;
    assert_eq!(session.game_state().await.total_coins, 12);
    drain(&mut signals);

    feed(
        &session,
        &json!({
            "type": "action_made",
            "player": "ada",
            "action": "flip",
            "coin_index": 0,
            "player_coins": {"ada": coins(1), "bob": []},
            "total_completed": 0
        })
        .to_string(),
    )
    .await;
    assert!(drain(&mut signals).contains(&SessionSignal::StateChanged {
        mode: ApplyMode::Incremental,
    }));
    assert_eq!(session.game_state().await.heads_count("ada"), 1);
}

#[tokio::test]
async fn reset_clears_round_history() {
    let session = active_player(Arc::new(MockApi::default())).await;
    feed(
        &session,
        &json!({
            "type": "round_complete",
            "round_number": 1,
            "round_result": {"round_number": 1, "game_duration_seconds": 50.0}
        })
        .to_string(),
    )
    .await;
    assert_eq!(session.round_results().await.len(), 1);

    feed(
        &session,
        &json!({
            "type": "game_reset",
            "round_type": "three_rounds",
            "current_round": 0,
            "state": "lobby",
            "player_coins": {},
            "total_completed": 0,
            "player_timers": {}
        })
        .to_string(),
    )
    .await;

    let state = session.game_state().await;
    assert_eq!(state.phase, Phase::Lobby);
    assert_eq!(state.players, vec!["ada", "bob"]);
    assert!(state.player_coins.is_empty());
    assert!(session.round_results().await.is_empty());
    assert!(session.summary().await.is_none());
}

#[tokio::test]
async fn host_disconnect_closes_the_room() {
    let api = Arc::new(MockApi::default());
    let session = active_player(api.clone()).await;

    feed(
        &session,
        r#"{"type": "host_disconnected", "username": "eve"}"#,
    )
    .await;

    assert!(session.is_closed());
    assert!(matches!(
        actions::flip_coin(&session, 0).await,
        Err(ActionError::Closed)
    ));
    assert_eq!(
        actions::begin_hold(&session, 0).await,
        Err(HoldError::NotPermitted)
    );
    assert_eq!(api.count("flip"), 0);
}
