use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::error::Error;

const TRANSITION_BUFFER: usize = 64;

/// What the reader surface shows for a chapter.
#[derive(Debug, Clone)]
pub enum ReaderState {
    Wait,
    Loading,
    Loaded,
    Error(Arc<Error>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderPhase {
    Wait,
    Loading,
    Loaded,
    Error,
}

impl fmt::Display for ReaderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReaderPhase::Wait => "wait",
            ReaderPhase::Loading => "loading",
            ReaderPhase::Loaded => "loaded",
            ReaderPhase::Error => "error",
        };
        f.write_str(name)
    }
}

impl ReaderState {
    pub fn phase(&self) -> ReaderPhase {
        match self {
            ReaderState::Wait => ReaderPhase::Wait,
            ReaderState::Loading => ReaderPhase::Loading,
            ReaderState::Loaded => ReaderPhase::Loaded,
            ReaderState::Error(_) => ReaderPhase::Error,
        }
    }

    pub fn error(&self) -> Option<&Arc<Error>> {
        match self {
            ReaderState::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// `Wait` is reachable from everywhere so a chapter switch can always start over.
pub fn can_transition(from: ReaderPhase, to: ReaderPhase) -> bool {
    match to {
        ReaderPhase::Wait => from != ReaderPhase::Wait,
        ReaderPhase::Loading => from == ReaderPhase::Wait,
        ReaderPhase::Loaded | ReaderPhase::Error => from == ReaderPhase::Loading,
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub from: ReaderPhase,
    pub to: ReaderState,
}

/// Single writer for a [`ReaderState`].
///
/// Observers either watch the latest state or subscribe to every accepted
/// transition. Transitions that break the lifecycle are dropped.
#[derive(Debug)]
pub struct ReaderStateMachine {
    state: watch::Sender<ReaderState>,
    transitions: broadcast::Sender<Transition>,
}

impl ReaderStateMachine {
    pub fn new() -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        Self {
            state: watch::Sender::new(ReaderState::Wait),
            transitions,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state.borrow().clone()
    }

    pub fn phase(&self) -> ReaderPhase {
        self.state.borrow().phase()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReaderState> {
        self.state.subscribe()
    }

    pub fn transitions(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    pub fn reset(&self) -> bool {
        self.transition(ReaderState::Wait)
    }

    pub fn start_loading(&self) -> bool {
        self.transition(ReaderState::Loading)
    }

    pub fn finish_loading(&self) -> bool {
        self.transition(ReaderState::Loaded)
    }

    pub fn fail(&self, error: Arc<Error>) -> bool {
        self.transition(ReaderState::Error(error))
    }

    pub fn transition(&self, next: ReaderState) -> bool {
        let mut from = None;
        self.state.send_if_modified(|current| {
            if !can_transition(current.phase(), next.phase()) {
                return false;
            }
            from = Some(current.phase());
            *current = next.clone();
            true
        });

        match from {
            Some(from) => {
                log::debug!("Reader state {} -> {}", from, next.phase());
                let _ = self.transitions.send(Transition { from, to: next });
                true
            }
            None => {
                log::trace!("Ignored reader state {} -> {}", self.phase(), next.phase());
                false
            }
        }
    }
}

impl Default for ReaderStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
