//! Update phases and the recorded trail of transitions

use crate::error::UpdateError;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    Checking,
    NoChange,
    Staging,
    BackingUp,
    Applying,
    Verifying,
    Success,
    ApplyFailed,
    RollingBack,
    RolledBack,
    RestartSkipUpdate,
}

impl UpdatePhase {
    /// Legal successors of this phase
    pub fn successors(&self) -> &'static [UpdatePhase] {
        use UpdatePhase::*;
        match self {
            Idle => &[Checking],
            Checking => &[NoChange, Staging],
            NoChange => &[Idle],
            // A failed stage or backup abandons the update untouched
            Staging => &[BackingUp, Idle],
            BackingUp => &[Applying, Idle],
            Applying => &[Verifying, ApplyFailed],
            Verifying => &[Success, ApplyFailed],
            Success => &[RestartSkipUpdate],
            ApplyFailed => &[RollingBack],
            RollingBack => &[RolledBack],
            RolledBack => &[Idle],
            RestartSkipUpdate => &[],
        }
    }

    pub fn can_transition_to(&self, next: UpdatePhase) -> bool {
        self.successors().contains(&next)
    }
}

/// Every phase the agent passed through, in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTrail {
    phases: Vec<UpdatePhase>,
}

impl Default for PhaseTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTrail {
    pub fn new() -> Self {
        Self {
            phases: vec![UpdatePhase::Idle],
        }
    }

    pub fn current(&self) -> UpdatePhase {
        self.phases
            .last()
            .copied()
            .unwrap_or(UpdatePhase::Idle)
    }

    pub fn advance(&mut self, next: UpdatePhase) -> Result<(), UpdateError> {
        let from = self.current();
        if !from.can_transition_to(next) {
            return Err(UpdateError::InvalidTransition { from, to: next });
        }
        info!("Update phase {:?} -> {:?}", from, next);
        self.phases.push(next);
        Ok(())
    }

    pub fn phases(&self) -> &[UpdatePhase] {
        &self.phases
    }

    pub fn contains(&self, phase: UpdatePhase) -> bool {
        self.phases.contains(&phase)
    }
}
