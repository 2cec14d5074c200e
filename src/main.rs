//! Penny Flow observer: joins a room, mirrors its state and prints the game summary on exit.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use time::OffsetDateTime;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use penny_flow_client::{
    config::ClientConfig,
    services::{
        actions,
        api::ServerApi,
        http_api::HttpServerApi,
        timer::timer_display,
        transport,
    },
    state::{
        GameSession, Renderer, SessionOptions, SharedSession,
        game::GameState,
        signals::{NoticeLevel, SessionSignal},
        state_machine::Phase,
    },
};

/// Logs a one-line digest of every state the session lands.
struct LoggingRenderer;

impl Renderer for LoggingRenderer {
    fn render(&self, state: &GameState) {
        debug!(
            phase = ?state.phase,
            round = state.current_round,
            total_rounds = state.total_rounds,
            batch = state.batch_size,
            completed = state.total_completed,
            players = state.players.len(),
            "state rendered"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ClientConfig::load();
    let api = HttpServerApi::new(&config.server_url, config.request_timeout())
        .context("building HTTP client")?;

    let room_id = match config.room_id.clone() {
        Some(room) => room,
        None => {
            let room = api.create_room().await.context("creating room")?;
            info!(room = %room, "created room");
            room
        }
    };

    let session = GameSession::new(
        room_id,
        config.username.clone(),
        SessionOptions::from(&config),
        Arc::new(api),
        Arc::new(LoggingRenderer),
    );
    tokio::spawn(log_signals(session.clone()));
    let finished = wait_for_finish(session.subscribe());

    actions::join_room(&session, config.spectator)
        .await
        .context("joining room")?;

    let url = transport::websocket_url(&config.server_url, session.room_id(), session.username());
    let channel = tokio::select! {
        result = transport::run(session.clone(), &url) => result,
        _ = refresh_timers(session.clone(), config.refresh_interval()) => Ok(()),
        _ = finished => Ok(()),
        _ = shutdown_signal() => {
            info!("shutdown requested");
            Ok(())
        }
    };
    if let Err(err) = &channel {
        error!(error = %err, "websocket channel terminated");
    }

    if let Some(summary) = session.summary().await {
        let rendered = serde_json::to_string_pretty(&summary).context("encoding summary")?;
        println!("{rendered}");
    }
    channel.context("running websocket channel")
}

/// Resolve once the session reports the end of the game.
async fn wait_for_finish(signals: broadcast::Receiver<SessionSignal>) {
    let mut signals = BroadcastStream::new(signals);
    while let Some(signal) = signals.next().await {
        if matches!(signal, Ok(SessionSignal::GameFinished)) {
            return;
        }
    }
}

/// Forward session signals to the log.
async fn log_signals(session: SharedSession) {
    let mut signals = BroadcastStream::new(session.subscribe());
    while let Some(signal) = signals.next().await {
        match signal {
            Ok(SessionSignal::Notice(advisory)) => match advisory.level {
                NoticeLevel::Info => info!(message = %advisory.message, "notice"),
                NoticeLevel::Warning | NoticeLevel::Error => {
                    warn!(message = %advisory.message, level = ?advisory.level, "notice")
                }
            },
            Ok(SessionSignal::RoundRecorded { round, outcome }) => {
                info!(round, ?outcome, "round recorded")
            }
            Ok(SessionSignal::GameFinished) => info!("game finished"),
            Ok(other) => debug!(signal = ?other, "session signal"),
            Err(err) => warn!(error = %err, "signal subscriber lagged"),
        }
    }
}

/// Periodically log the running round timer while a round is active.
async fn refresh_timers(session: SharedSession, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let (phase, round, elapsed) = session
            .read_state(|state| {
                (
                    state.phase,
                    state.current_round,
                    timer_display(&state.game_timer, OffsetDateTime::now_utc()),
                )
            })
            .await;
        if phase == Phase::Active {
            info!(round, elapsed = %elapsed, "round timer");
        }
    }
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,penny_flow_client=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
