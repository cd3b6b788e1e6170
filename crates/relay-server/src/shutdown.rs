//! Lifecycle state machine and listener cancellation.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio_util::sync::CancellationToken;

use crate::errors::RelayError;

/// Server lifecycle.
///
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`, with
/// `Starting -> Stopped` when the listener fails to bind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not listening.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Accepting peers.
    Running,
    /// Draining peers.
    Stopping,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Stopping => 3,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        })
    }
}

/// Coordinates start/stop transitions and signals the listener to stop.
pub struct ShutdownCoordinator {
    state: AtomicU8,
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator in `Stopped`.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Stopped.as_u8()),
            token: CancellationToken::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether peers are being accepted.
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<(), LifecycleState> {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(LifecycleState::from_u8)
    }

    /// `Stopped -> Starting`. A coordinator that has already stopped a
    /// listener cannot start another.
    pub fn begin_start(&self) -> Result<(), RelayError> {
        if self.token.is_cancelled() {
            return Err(RelayError::InvalidState(self.state()));
        }
        self.transition(LifecycleState::Stopped, LifecycleState::Starting)
            .map_err(RelayError::InvalidState)
    }

    /// `Starting -> Running`.
    pub fn mark_running(&self) -> Result<(), RelayError> {
        self.transition(LifecycleState::Starting, LifecycleState::Running)
            .map_err(RelayError::InvalidState)
    }

    /// `Starting -> Stopped` after a failed bind.
    pub fn fail_start(&self) {
        let _ = self.transition(LifecycleState::Starting, LifecycleState::Stopped);
    }

    /// `Running -> Stopping`. Returns `false` if the server was not running,
    /// so only the first caller performs the shutdown sequence.
    pub fn begin_stop(&self) -> bool {
        self.transition(LifecycleState::Running, LifecycleState::Stopping)
            .is_ok()
    }

    /// `Stopping -> Stopped`.
    pub fn mark_stopped(&self) {
        let _ = self.transition(LifecycleState::Stopping, LifecycleState::Stopped);
    }

    /// Token the listener watches.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Tell the listener to stop accepting.
    pub fn cancel_listener(&self) {
        self.token.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
