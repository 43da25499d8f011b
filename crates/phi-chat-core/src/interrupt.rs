//! Cooperative cancellation of in-flight generations.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::runtime::StopReason;

const IDLE: u8 = 0;
const ACTIVE: u8 = 1;
const INTERRUPTED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptState {
    /// No generation is running; `interrupt` is a no-op.
    Idle,
    /// A generation is running and may be interrupted.
    Active,
    /// Interruption requested; the running generation stops at its next check.
    Interrupted,
}

/// Shared cancellation token, one per session.
///
/// ```text
///        arm()              interrupt()
/// Idle ────────► Active ───────────────► Interrupted
///  ▲               │                         │
///  └── disarm() ───┴──────── disarm() ───────┘
/// ```
///
/// The session arms the handle at the start of every generation and disarms
/// it when the generation returns, whatever the outcome. An interrupt issued
/// while idle therefore cannot stop the next generation.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    state: Arc<AtomicU8>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> InterruptState {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => InterruptState::Active,
            INTERRUPTED => InterruptState::Interrupted,
            _ => InterruptState::Idle,
        }
    }

    /// Request the active generation to stop. Returns `false` when nothing
    /// was running (or it was already interrupted).
    pub fn interrupt(&self) -> bool {
        self.state
            .compare_exchange(ACTIVE, INTERRUPTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.load(Ordering::Acquire) == INTERRUPTED
    }

    /// Reset transition: clears a stale interruption and marks a generation
    /// as running.
    pub(crate) fn arm(&self) {
        self.state.store(ACTIVE, Ordering::Release);
    }

    pub(crate) fn disarm(&self) {
        self.state.store(IDLE, Ordering::Release);
    }
}

// ── Stopping criteria ─────────────────────────────────────────────────────────

/// Policy consulted by the model before every sampling step.
pub trait StoppingCriteria: Send + Sync {
    /// `generated` holds the ids produced so far in this generation.
    fn should_stop(&self, generated: &[u32]) -> bool;

    /// Why generation ends now, if it does.
    fn stop_reason(&self, generated: &[u32]) -> Option<StopReason> {
        self.should_stop(generated)
            .then_some(StopReason::Interrupted)
    }
}

impl StoppingCriteria for InterruptHandle {
    fn should_stop(&self, _generated: &[u32]) -> bool {
        self.is_interrupted()
    }
}

/// Token budget of one generation.
#[derive(Debug, Clone, Copy)]
pub struct MaxNewTokens(pub usize);

impl StoppingCriteria for MaxNewTokens {
    fn should_stop(&self, generated: &[u32]) -> bool {
        generated.len() >= self.0
    }

    fn stop_reason(&self, generated: &[u32]) -> Option<StopReason> {
        self.should_stop(generated)
            .then_some(StopReason::MaxNewTokens)
    }
}

/// Stops as soon as any member does; the first member that fires names the
/// reason.
#[derive(Default)]
pub struct StoppingCriteriaList {
    criteria: Vec<Box<dyn StoppingCriteria>>,
}

impl StoppingCriteriaList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, criteria: impl StoppingCriteria + 'static) -> Self {
        self.criteria.push(Box::new(criteria));
        self
    }
}

impl StoppingCriteria for StoppingCriteriaList {
    fn should_stop(&self, generated: &[u32]) -> bool {
        self.criteria.iter().any(|c| c.should_stop(generated))
    }

    fn stop_reason(&self, generated: &[u32]) -> Option<StopReason> {
        self.criteria.iter().find_map(|c| c.stop_reason(generated))
    }
}
