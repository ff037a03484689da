use serde::{Deserialize, Serialize};

use crate::orchestrator::RunStatus;

/// Run identity, lifecycle status and elapsed runtime of the tracked run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Option<String>,
    pub status: RunStatus,
    /// Whole seconds since start; only non-zero while `status` is `RUNNING`.
    pub runtime: u64,
}

impl RunState {
    pub fn set_run_id(&mut self, run_id: Option<String>) {
        self.run_id = run_id;
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        if status != RunStatus::Running {
            self.runtime = 0;
        }
    }

    pub fn set_runtime(&mut self, runtime: u64) {
        self.runtime = if self.status == RunStatus::Running { runtime } else { 0 };
    }

    /// Back to `(None, NOT_STARTED, 0)`.
    pub fn clear(&mut self) {
        *self = RunState::default();
    }

    /// A run id is known and the orchestrator still reports it in flight.
    pub fn is_in_flight(&self) -> bool {
        self.run_id.is_some() && self.status.is_active()
    }
}
