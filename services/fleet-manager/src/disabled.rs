//! Enable/disable state for clouds and templates.
//!
//! Two independent flags combine with OR:
//!
//! - **By choice**: set by an operator, sticky, never cleared automatically.
//! - **By system**: set by the provisioning engine after a systemic failure
//!   and cleared automatically once its window elapses. This is the circuit
//!   breaker that stops a broken cloud from being hammered.
//!
//! Time is read from [`tokio::time::Instant`] so tests can drive it with a
//! paused clock.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Default circuit-breaker window after a failure.
pub const DEFAULT_DISABLE_DURATION: Duration = Duration::from_millis(300_000);

#[derive(Debug, Clone)]
struct SystemDisable {
    reason: String,
    cause: Option<String>,
    since: Instant,
    until: Instant,
}

/// Point-in-time view of an active system disablement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemDisablement {
    pub reason: String,
    pub cause: Option<String>,
    /// How long ago the disablement started.
    pub elapsed: Duration,
    /// How long until it clears.
    pub remaining: Duration,
}

/// Disablement state of a cloud or template.
#[derive(Debug, Default)]
pub struct DisabledState {
    by_choice: AtomicBool,
    by_system: Mutex<Option<SystemDisable>>,
}

impl DisabledState {
    /// Create a state, optionally disabled by choice.
    pub fn new(disabled_by_choice: bool) -> Self {
        Self {
            by_choice: AtomicBool::new(disabled_by_choice),
            by_system: Mutex::new(None),
        }
    }

    pub fn set_disabled_by_choice(&self, disabled: bool) {
        self.by_choice.store(disabled, Ordering::SeqCst);
    }

    pub fn disabled_by_choice(&self) -> bool {
        self.by_choice.load(Ordering::SeqCst)
    }

    /// Disable for `duration`, replacing any earlier system disablement.
    pub fn disable_by_system(
        &self,
        reason: impl Into<String>,
        duration: Duration,
        cause: Option<&dyn std::error::Error>,
    ) {
        let now = Instant::now();
        *self.system() = Some(SystemDisable {
            reason: reason.into(),
            cause: cause.map(|e| e.to_string()),
            since: now,
            until: now + duration,
        });
    }

    /// Returns true while a system disablement is in force. An expired
    /// disablement is cleared as a side effect.
    pub fn disabled_by_system(&self) -> bool {
        self.current_system().is_some()
    }

    /// Details of the active system disablement, if any.
    pub fn system_disablement(&self) -> Option<SystemDisablement> {
        let now = Instant::now();
        self.current_system().map(|d| SystemDisablement {
            reason: d.reason,
            cause: d.cause,
            elapsed: now.saturating_duration_since(d.since),
            remaining: d.until.saturating_duration_since(now),
        })
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by_choice() || self.disabled_by_system()
    }

    fn current_system(&self) -> Option<SystemDisable> {
        let mut guard = self.system();
        match guard.as_ref() {
            Some(d) if Instant::now() < d.until => Some(d.clone()),
            Some(_) => {
                *guard = None;
                None
            }
            None => None,
        }
    }

    fn system(&self) -> MutexGuard<'_, Option<SystemDisable>> {
        self.by_system.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for DisabledState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let by_choice = self.disabled_by_choice();
        match self.system_disablement() {
            Some(d) => {
                if by_choice {
                    f.write_str("ByChoice,")?;
                }
                write!(
                    f,
                    "BySystem,{}s ago,{}s remaining,{}",
                    d.elapsed.as_secs(),
                    d.remaining.as_secs(),
                    d.reason
                )
            }
            None if by_choice => f.write_str("ByChoice"),
            None => f.write_str("No"),
        }
    }
}
