//! Orchestrator read model and its transition function.
//!
//! Every change to [`OrchestratorState`] goes through [`transition`], a pure
//! function of the current state and one [`Event`]. [`StateStore`] applies
//! events for the current boot epoch only and fans every change out to
//! subscribers in order as [`StateUpdate`]s.

use crate::devserver::DevServerEvent;
use crate::error::ErrorKind;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Boot pipeline stage. Declaration order is pipeline order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Booting,
    Fetching,
    Mounting,
    Installing,
    Starting,
    Running,
    Error,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Booting => "booting",
            Phase::Fetching => "fetching",
            Phase::Mounting => "mounting",
            Phase::Installing => "installing",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Error => "error",
        }
    }

    /// No further automatic progress happens from this phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Running | Phase::Error)
    }

    /// Whether the pipeline is past mounting, i.e. the sandbox holds files.
    pub fn is_mounted(&self) -> bool {
        matches!(self, Phase::Installing | Phase::Starting | Phase::Running)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the UI renders. `preview_url` is set only while running; `error`
/// and `error_kind` only in the error phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub phase: Phase,
    pub preview_url: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub output: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Back to idle with empty output.
    Reset,
    BootStarted,
    Fetching,
    Mounting,
    DevServer(DevServerEvent),
    Failed { message: String, kind: ErrorKind },
}

/// What subscribers receive. A snapshot replaces the whole state; an output
/// line is appended to the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    Snapshot(OrchestratorState),
    Output(String),
}

impl OrchestratorState {
    /// Fold one update into a subscriber's copy of the state.
    pub fn apply(&mut self, update: StateUpdate) {
        match update {
            StateUpdate::Snapshot(state) => *self = state,
            StateUpdate::Output(line) => self.output.push(line),
        }
    }
}

/// How an event changed the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Unchanged,
    /// Only a new output line.
    Appended,
    Replaced,
}

/// Compute the state after `event`. Events that do not apply to the current
/// phase leave the state unchanged.
pub fn transition(state: &OrchestratorState, event: Event) -> OrchestratorState {
    let mut next = state.clone();
    step(&mut next, event);
    next
}

/// In-place form of [`transition`].
fn step(state: &mut OrchestratorState, event: Event) -> Change {
    let before = (
        state.phase,
        state.preview_url.clone(),
        state.error.clone(),
        state.error_kind,
    );
    match event {
        Event::Reset => {
            if *state == OrchestratorState::default() {
                return Change::Unchanged;
            }
            *state = OrchestratorState::default();
            return Change::Replaced;
        }
        Event::BootStarted => {
            if state.phase == Phase::Idle {
                state.phase = Phase::Booting;
                state.output.clear();
            }
        }
        Event::Fetching => advance(state, Phase::Fetching),
        Event::Mounting => advance(state, Phase::Mounting),
        Event::DevServer(DevServerEvent::Installing) => advance(state, Phase::Installing),
        Event::DevServer(DevServerEvent::Starting) => advance(state, Phase::Starting),
        Event::DevServer(DevServerEvent::Output(line)) => {
            if state.phase == Phase::Idle {
                return Change::Unchanged;
            }
            state.output.push(line);
            return Change::Appended;
        }
        Event::DevServer(DevServerEvent::Ready(server)) => {
            if state.phase >= Phase::Mounting && state.phase != Phase::Error {
                state.phase = Phase::Running;
                state.preview_url = Some(server.url);
            }
        }
        Event::DevServer(DevServerEvent::Failed { message, kind }) | Event::Failed { message, kind } => {
            // The first failure of an attempt is the one reported.
            if !matches!(state.phase, Phase::Idle | Phase::Error) {
                state.phase = Phase::Error;
                state.preview_url = None;
                state.error = Some(message);
                state.error_kind = Some(kind);
            }
        }
    }
    let after = (
        state.phase,
        state.preview_url.clone(),
        state.error.clone(),
        state.error_kind,
    );
    if after == before {
        Change::Unchanged
    } else {
        Change::Replaced
    }
}

/// Forward-only move within the pipeline.
fn advance(state: &mut OrchestratorState, target: Phase) {
    if state.phase != Phase::Idle && state.phase != Phase::Error && state.phase < target {
        state.phase = target;
    }
}

struct StoreInner {
    epoch: u64,
    state: OrchestratorState,
    subscribers: Vec<mpsc::UnboundedSender<StateUpdate>>,
}

impl StoreInner {
    fn publish(&mut self, change: Change) {
        let update = match change {
            Change::Unchanged => return,
            Change::Appended => match self.state.output.last() {
                Some(line) => StateUpdate::Output(line.clone()),
                None => return,
            },
            Change::Replaced => StateUpdate::Snapshot(self.state.clone()),
        };
        self.subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }
}

/// Owner of the live [`OrchestratorState`].
///
/// Each boot attempt runs under an epoch handed out by [`reset`](Self::reset).
/// Events tagged with an older epoch are dropped, so a superseded boot that
/// is still unwinding cannot overwrite the state of its replacement.
pub struct StateStore {
    inner: Mutex<StoreInner>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                epoch: 0,
                state: OrchestratorState::default(),
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn snapshot(&self) -> OrchestratorState {
        self.inner.lock().state.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Apply `event` if `epoch` is current. Returns whether the state changed.
    pub fn dispatch(&self, epoch: u64, event: Event) -> bool {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            tracing::debug!("Dropping {event:?} from superseded boot epoch {epoch}");
            return false;
        }
        let previous = inner.state.phase;
        let change = step(&mut inner.state, event);
        if inner.state.phase != previous {
            tracing::info!("Phase {} -> {}", previous, inner.state.phase);
        }
        inner.publish(change);
        change != Change::Unchanged
    }

    /// Start a new epoch from the idle state and return it.
    pub fn reset(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        let change = step(&mut inner.state, Event::Reset);
        inner.publish(change);
        inner.epoch
    }

    /// Receive a snapshot of the current state immediately, then every
    /// change in order. Output lines arrive one at a time rather than as
    /// repeated snapshots of the whole log.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if tx.send(StateUpdate::Snapshot(inner.state.clone())).is_ok() {
            inner.subscribers.push(tx);
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ServerReady;

    fn ready(url: &str) -> Event {
        Event::DevServer(DevServerEvent::Ready(ServerReady {
            port: 3000,
            url: url.into(),
        }))
    }

    fn failed(message: &str) -> Event {
        Event::Failed {
            message: message.into(),
            kind: ErrorKind::Network,
        }
    }

    fn run(events: Vec<Event>) -> OrchestratorState {
        events
            .into_iter()
            .fold(OrchestratorState::default(), |state, event| transition(&state, event))
    }

    #[test]
    fn full_pipeline_reaches_running_with_url() {
        let mut state = OrchestratorState::default();
        let mut phases = vec![state.phase];
        for event in [
            Event::BootStarted,
            Event::Fetching,
            Event::Mounting,
            Event::DevServer(DevServerEvent::Installing),
            Event::DevServer(DevServerEvent::Starting),
            ready("https://abc-3000.sandbox.test"),
        ] {
            assert_eq!(state.preview_url, None);
            state = transition(&state, event);
            phases.push(state.phase);
        }
        assert_eq!(
            phases,
            vec![
                Phase::Idle,
                Phase::Booting,
                Phase::Fetching,
                Phase::Mounting,
                Phase::Installing,
                Phase::Starting,
                Phase::Running,
            ]
        );
        assert_eq!(state.preview_url.as_deref(), Some("https://abc-3000.sandbox.test"));
    }

    #[test]
    fn phases_never_move_backwards() {
        let state = run(vec![Event::BootStarted, Event::Mounting, Event::Fetching]);
        assert_eq!(state.phase, Phase::Mounting);
    }

    #[test]
    fn nothing_happens_before_boot_starts() {
        let state = run(vec![
            Event::Fetching,
            Event::DevServer(DevServerEvent::Output("x".into())),
            failed("boom"),
        ]);
        assert_eq!(state, OrchestratorState::default());
    }

    #[test]
    fn error_is_sticky_and_clears_preview_url() {
        let state = run(vec![
            Event::BootStarted,
            Event::Mounting,
            ready("http://localhost:3000"),
            failed("dev server crashed"),
            ready("http://localhost:3001"),
            Event::DevServer(DevServerEvent::Installing),
            failed("second failure"),
        ]);
        assert_eq!(state.phase, Phase::Error);
        assert_eq!(state.preview_url, None);
        assert_eq!(state.error.as_deref(), Some("dev server crashed"));
        assert_eq!(state.error_kind, Some(ErrorKind::Network));
    }

    #[test]
    fn repeated_ready_updates_the_url() {
        let state = run(vec![
            Event::BootStarted,
            Event::Mounting,
            Event::DevServer(DevServerEvent::Starting),
            ready("http://localhost:3000"),
            ready("http://localhost:3001"),
        ]);
        assert_eq!(state.phase, Phase::Running);
        assert_eq!(state.preview_url.as_deref(), Some("http://localhost:3001"));
    }

    #[test]
    fn reset_then_boot_clears_output_and_error() {
        let errored = run(vec![
            Event::BootStarted,
            Event::DevServer(DevServerEvent::Output("npm ERR!".into())),
            failed("install failed"),
        ]);
        let state = transition(&transition(&errored, Event::Reset), Event::BootStarted);
        assert_eq!(state.phase, Phase::Booting);
        assert!(state.output.is_empty());
        assert_eq!(state.error, None);
        assert_eq!(state.error_kind, None);
    }

    #[test]
    fn store_drops_events_from_old_epochs() {
        let store = StateStore::new();
        let old = store.reset();
        assert!(store.dispatch(old, Event::BootStarted));

        let current = store.reset();
        assert!(!store.dispatch(old, Event::Fetching));
        assert_eq!(store.snapshot().phase, Phase::Idle);

        assert!(store.dispatch(current, Event::BootStarted));
        assert_eq!(store.snapshot().phase, Phase::Booting);
    }

    #[tokio::test]
    async fn subscribers_see_current_state_then_each_change() {
        let store = StateStore::new();
        let epoch = store.reset();
        let mut rx = store.subscribe();

        store.dispatch(epoch, Event::BootStarted);
        store.dispatch(epoch, Event::BootStarted);
        store.dispatch(epoch, Event::Fetching);

        let mut phases = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                StateUpdate::Snapshot(state) => phases.push(state.phase),
                other => panic!("unexpected update {other:?}"),
            }
        }
        assert_eq!(phases, vec![Phase::Idle, Phase::Booting, Phase::Fetching]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn output_lines_are_sent_one_at_a_time() {
        let store = StateStore::new();
        let epoch = store.reset();
        store.dispatch(epoch, Event::BootStarted);
        store.dispatch(epoch, Event::DevServer(DevServerEvent::Output("first".into())));
        let mut rx = store.subscribe();

        for line in ["second", "third"] {
            store.dispatch(epoch, Event::DevServer(DevServerEvent::Output(line.into())));
        }
        store.dispatch(epoch, Event::Fetching);

        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        assert_eq!(updates[1], StateUpdate::Output("second".into()));
        assert_eq!(updates[2], StateUpdate::Output("third".into()));
        assert_eq!(updates.len(), 4);

        let mut local = OrchestratorState::default();
        for update in updates {
            local.apply(update);
        }
        assert_eq!(local, store.snapshot());
        assert_eq!(local.output, vec!["first", "second", "third"]);
    }

    #[test]
    fn output_before_boot_is_not_published() {
        let store = StateStore::new();
        let epoch = store.reset();
        assert!(!store.dispatch(epoch, Event::DevServer(DevServerEvent::Output("x".into()))));
        assert!(store.snapshot().output.is_empty());
    }
}
