//! Coordinator state definitions.

/// Coordinator operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Created, recovery not yet run.
    Starting,
    /// Replaying the decision log and finishing undecided transactions.
    Recovering,
    /// Coordinator is running and accepting requests.
    Running,
    /// Coordinator is shutting down, not accepting new transactions.
    ShuttingDown,
    /// Coordinator is stopped.
    Stopped,
}

impl CoordinatorState {
    /// Check if the coordinator is operational.
    pub fn is_operational(&self) -> bool {
        matches!(self, CoordinatorState::Running)
    }

    /// Check if the coordinator is accepting new transactions.
    ///
    /// `Starting` accepts too, for embedders that never call `start`.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, CoordinatorState::Starting | CoordinatorState::Running)
    }

    /// Check if the coordinator is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CoordinatorState::Stopped)
    }
}
