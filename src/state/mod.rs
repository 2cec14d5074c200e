pub mod game;
pub mod guard;
pub mod holds;
pub mod signals;
pub mod state_machine;
pub mod stats;
pub mod store;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use indexmap::IndexMap;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{info, warn};

use crate::{
    config::ClientConfig,
    dto::{game::GameSnapshotDto, game::RoundResultDto, summary::GameSummary},
    services::{api::ServerApi, summary::summarize},
    state::{
        game::{GameState, Role},
        guard::{ActionClass, ActionGuard},
        holds::{CoinRef, HoldTracker},
        signals::{Advisory, SessionSignal, SignalHub},
        state_machine::{Phase, PhaseEvent, PhaseMachine},
        stats::{InsertOutcome, RepairReport, RoundResult, StatsAggregator},
        store::{ApplyPolicy, ApplyOutcome, StateStore},
    },
};

pub type SharedSession = Arc<GameSession>;

/// Presentation-layer callback invoked after every successful state mutation.
pub trait Renderer: Send + Sync {
    fn render(&self, state: &GameState);
}

/// Renderer that draws nothing.
pub struct NoopRenderer;

impl Renderer for NoopRenderer {
    fn render(&self, _state: &GameState) {}
}

/// Tunables taken from [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub hold_threshold: Duration,
    pub request_timeout: Duration,
    pub signal_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            hold_threshold: Duration::from_millis(800),
            request_timeout: Duration::from_secs(5),
            signal_capacity: 64,
        }
    }
}

impl From<&ClientConfig> for SessionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            hold_threshold: config.hold_threshold(),
            request_timeout: config.request_timeout(),
            signal_capacity: config.signal_capacity,
        }
    }
}

/// Online flags for everyone the server has told us about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Presence {
    online: IndexMap<String, bool>,
}

impl Presence {
    pub fn is_online(&self, username: &str) -> bool {
        self.online.get(username).copied().unwrap_or(false)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, bool)> {
        self.online.iter().map(|(name, online)| (name.as_str(), *online))
    }

    fn set(&mut self, username: &str, online: bool) -> bool {
        self.online.insert(username.to_string(), online) != Some(online)
    }

    fn replace(&mut self, online: IndexMap<String, bool>) -> bool {
        if self.online == online {
            return false;
        }
        self.online = online;
        true
    }
}

/// How [`GameSession::update_state`] should land a candidate state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateUpdate {
    /// Replace wholesale regardless of reconciliation rules.
    pub force_replace: bool,
    /// Phase event carried by the notification, if any.
    pub phase_event: Option<PhaseEvent>,
}

impl StateUpdate {
    /// Reconcile without touching the phase.
    pub fn reconcile() -> Self {
        Self::default()
    }

    /// Replace wholesale, optionally moving the phase.
    pub fn replace(phase_event: Option<PhaseEvent>) -> Self {
        Self {
            force_replace: true,
            phase_event,
        }
    }

    /// Reconcile and move the phase.
    pub fn transition(event: PhaseEvent) -> Self {
        Self {
            force_replace: false,
            phase_event: Some(event),
        }
    }
}

struct Mirror {
    store: StateStore,
    phases: PhaseMachine,
    role: Role,
}

/// Everything one client keeps about the room it joined: the mirrored state,
/// round history, pending requests, gestures and presence.
pub struct GameSession {
    room_id: String,
    username: String,
    options: SessionOptions,
    api: Arc<dyn ServerApi>,
    renderer: Arc<dyn Renderer>,
    mirror: RwLock<Mirror>,
    stats: RwLock<StatsAggregator>,
    guard: ActionGuard,
    holds: Mutex<HoldTracker>,
    presence: RwLock<Presence>,
    signals: SignalHub,
    closed: AtomicBool,
}

impl GameSession {
    /// Construct a session wrapped in an [`Arc`] so it can be cloned cheaply.
    pub fn new(
        room_id: impl Into<String>,
        username: impl Into<String>,
        options: SessionOptions,
        api: Arc<dyn ServerApi>,
        renderer: Arc<dyn Renderer>,
    ) -> SharedSession {
        let room_id = room_id.into();
        let store = StateStore::new();
        let signals = SignalHub::new(options.signal_capacity);
        Arc::new(Self {
            room_id,
            username: username.into(),
            options,
            api,
            renderer,
            mirror: RwLock::new(Mirror {
                store,
                phases: PhaseMachine::new(),
                role: Role::Unknown,
            }),
            stats: RwLock::new(StatsAggregator::new()),
            guard: ActionGuard::new(),
            holds: Mutex::new(HoldTracker::new()),
            presence: RwLock::new(Presence::default()),
            signals,
            closed: AtomicBool::new(false),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Handle to the outbound API.
    pub fn api(&self) -> Arc<dyn ServerApi> {
        self.api.clone()
    }

    /// Pending-request flags.
    pub fn guard(&self) -> &ActionGuard {
        &self.guard
    }

    /// Whether a request of `class` is in flight.
    pub fn is_action_pending(&self, class: ActionClass) -> bool {
        self.guard.is_pending(class)
    }

    /// Hold gestures and optimistic flips.
    pub fn holds(&self) -> &Mutex<HoldTracker> {
        &self.holds
    }

    /// Register a new subscriber for session signals.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    pub fn emit(&self, signal: SessionSignal) {
        self.signals.emit(signal);
    }

    /// Surface a recoverable message to the user.
    pub fn notify(&self, advisory: Advisory) {
        self.signals.emit(SessionSignal::Notice(advisory));
    }

    /// Copy of the current mirrored state.
    pub async fn game_state(&self) -> GameState {
        self.mirror.read().await.store.state().clone()
    }

    /// Run `read` against the current state without cloning it.
    pub async fn read_state<R>(&self, read: impl FnOnce(&GameState) -> R) -> R {
        let mirror = self.mirror.read().await;
        read(mirror.store.state())
    }

    pub async fn phase(&self) -> Phase {
        self.mirror.read().await.store.state().phase
    }

    /// Role of the local participant, derived from the last applied state.
    pub async fn role(&self) -> Role {
        self.mirror.read().await.role
    }

    /// Build a candidate from the current state and hand it to the store.
    /// This is the only path through which the mirrored state changes.
    pub async fn update_state<F>(&self, update: StateUpdate, build: F) -> ApplyOutcome
    where
        F: FnOnce(&GameState) -> GameState,
    {
        let mut mirror = self.mirror.write().await;
        let mut next = build(mirror.store.state());
        next.room_id.get_or_insert_with(|| self.room_id.clone());

        let from = mirror.phases.phase();
        match update.phase_event {
            Some(event) => {
                let (change, invalid) = mirror.phases.apply(event);
                if let Some(err) = invalid {
                    warn!(error = %err, "phase skipped a step; adopting server phase");
                }
                next.phase = change.to;
            }
            None => mirror.phases.resync(next.phase),
        }
        let to = mirror.phases.phase();

        let policy = if update.force_replace {
            ApplyPolicy::ForceReplace
        } else {
            ApplyPolicy::Reconcile {
                action_pending: self.guard.any_pending(),
            }
        };
        let outcome = mirror.store.apply_snapshot(next, policy);
        let role = mirror.store.state().role_of(&self.username);
        let previous_role = std::mem::replace(&mut mirror.role, role);

        let stale = self
            .holds
            .lock()
            .await
            .reconcile(&outcome, mirror.store.state());
        if stale > 0 {
            info!(stale, "dropped hold gestures invalidated by server state");
        }

        self.renderer.render(mirror.store.state());
        drop(mirror);

        self.signals
            .emit(SessionSignal::StateChanged { mode: outcome.mode });
        if from != to {
            info!(?from, ?to, "phase changed");
            self.signals.emit(SessionSignal::PhaseChanged { from, to });
        }
        if previous_role != role {
            info!(from = ?previous_role, to = ?role, "local role changed");
            self.signals.emit(SessionSignal::RoleChanged {
                from: previous_role,
                to: role,
            });
        }

        outcome
    }

    /// Drop the mirrored state and land `snapshot` on a blank state that keeps
    /// only the room roster.
    pub async fn reset_state(&self, snapshot: &GameSnapshotDto) -> ApplyOutcome {
        {
            let mut mirror = self.mirror.write().await;
            let roster = mirror.store.state().clone();
            mirror.store.reset();
            mirror.store.apply_snapshot(
                GameState {
                    room_id: roster.room_id,
                    players: roster.players,
                    host: roster.host,
                    spectators: roster.spectators,
                    ..GameState::default()
                },
                ApplyPolicy::ForceReplace,
            );
        }
        self.update_state(StateUpdate::replace(Some(PhaseEvent::Reset)), |current| {
            current.merged(snapshot)
        })
        .await
    }

    /// Record a server-reported round against the live state.
    pub async fn record_round(&self, dto: RoundResultDto, fallback_round: u32) -> InsertOutcome {
        let live = self.game_state().await;
        let round = dto.round_number.unwrap_or(fallback_round);
        let outcome = self.stats.write().await.record(dto, fallback_round, &live);
        self.emit_recorded(round, outcome);
        outcome
    }

    /// Record an already built result.
    pub async fn insert_round(&self, result: RoundResult) -> InsertOutcome {
        let round = result.round_number;
        let outcome = self.stats.write().await.insert(result);
        self.emit_recorded(round, outcome);
        outcome
    }

    fn emit_recorded(&self, round: u32, outcome: InsertOutcome) {
        if outcome != InsertOutcome::Duplicate {
            self.signals
                .emit(SessionSignal::RoundRecorded { round, outcome });
        }
    }

    /// Run extraction and placeholder synthesis against the live state.
    pub async fn ensure_rounds(&self) -> RepairReport {
        let live = self.game_state().await;
        let report = self.stats.write().await.ensure_complete(&live);
        if !report.is_empty() {
            warn!(
                extracted = ?report.extracted,
                placeholders = ?report.placeholders,
                "round history repaired"
            );
        }
        report
    }

    /// Recorded rounds in round order.
    pub async fn round_results(&self) -> Vec<RoundResult> {
        self.stats.read().await.rounds().cloned().collect()
    }

    /// Forget the round history.
    pub async fn clear_stats(&self) {
        self.stats.write().await.clear();
    }

    /// Game summary, repaired so every expected round is present. `None`
    /// only while nothing has been played.
    pub async fn summary(&self) -> Option<GameSummary> {
        let live = self.game_state().await;
        let mut stats = self.stats.write().await;
        if stats.is_empty() && live.current_round == 0 && live.phase == Phase::Lobby {
            return None;
        }
        stats.ensure_complete(&live);
        let rounds = stats.rounds().cloned().collect::<Vec<_>>();
        drop(stats);
        summarize(&rounds)
    }

    /// Copy of the presence map.
    pub async fn presence(&self) -> Presence {
        self.presence.read().await.clone()
    }

    /// Replace presence wholesale. Returns whether anything changed.
    pub async fn replace_presence(&self, online: IndexMap<String, bool>) -> bool {
        let changed = self.presence.write().await.replace(online);
        if changed {
            self.signals.emit(SessionSignal::PresenceChanged);
        }
        changed
    }

    /// Toggle one participant's online flag. Returns whether it changed.
    pub async fn set_online(&self, username: &str, online: bool) -> bool {
        let changed = self.presence.write().await.set(username, online);
        if changed {
            self.signals.emit(SessionSignal::PresenceChanged);
        }
        changed
    }

    /// Coins shown as flipped ahead of the server.
    pub async fn optimistic_flips(&self) -> Vec<CoinRef> {
        self.holds.lock().await.optimistic().cloned().collect()
    }

    /// Drop pending flags and gestures after the channel went away.
    pub async fn on_disconnect(&self, reason: &str) {
        let pending = self.guard.clear();
        let holds = self.holds.lock().await.cancel_all();
        warn!(reason, pending, holds, "disconnected from room");
        self.notify(Advisory::warning(format!("Disconnected: {reason}")));
    }

    /// Mark the room closed; further outbound actions fail.
    pub async fn close(&self, message: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.guard.clear();
        self.holds.lock().await.cancel_all();
        warn!(message, "room closed");
        self.notify(Advisory::error(message.to_string()));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
