//! Session progress as seen by one agent, from the last record it observed.

use std::fmt;
use crate::data::Status;

#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Phase {
    Pending,
    Capturing,
    Ready,
    Terminating,
    Completed,
}

impl Phase {
    pub fn observe(status: &Status, stopped: bool) -> Self {
        if stopped {
            Self::Completed
        } else if status.is_terminated() {
            Self::Terminating
        } else if status.is_ready() {
            Self::Ready
        } else if status.ready_count() > 0 {
            Self::Capturing
        } else {
            Self::Pending
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Completed
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use crate::data::{ConditionStatus, Kind};
    use super::*;

    #[test]
    fn follows_conditions() {
        let mut status = Status::default();
        assert_eq!(Phase::observe(&status, false), Phase::Pending);

        status.condition_mut(Kind::AgentsReady).observed_generation = 1;
        assert_eq!(Phase::observe(&status, false), Phase::Capturing);

        status.condition_mut(Kind::AgentsReady).set(ConditionStatus::True, "AllAgentsReady");
        assert_eq!(Phase::observe(&status, false), Phase::Ready);

        status.condition_mut(Kind::Terminate).set(ConditionStatus::True, "CaptureCompleted");
        assert_eq!(Phase::observe(&status, false), Phase::Terminating);
        assert_eq!(Phase::observe(&status, true), Phase::Completed);
    }

    #[test]
    fn deadline_completes_without_signal() {
        let status = Status::default();
        let phase = Phase::observe(&status, true);
        assert!(phase.is_terminal());
        assert!(Phase::Pending < phase);
    }
}
