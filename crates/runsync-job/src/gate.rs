//! Gate lifecycle as an explicit state machine
//!
//! ```text
//!   Pending --JobCreated--> Running --JobSucceeded--> Open
//!                              |
//!                              +-----JobFailed-----> Closed
//!   Open | Closed --Rerun--> Pending
//!   any --RemoteOpen/RemoteClosed--> Open/Closed
//! ```
//!
//! A remote decision always wins. Taken while the gate is Pending or Running
//! it is an abort: the Job is torn down and no result is reported.
//!
//! Any pair not in the table is illegal and reported as
//! [`JobError::IllegalTransition`].

use std::fmt;

use runsync_console::RunState;

use crate::error::JobError;

/// Local state of a gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    Pending,
    Running,
    Open,
    Closed,
}

/// Something that moves a gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateEvent {
    /// A Job was created for the gate
    JobCreated,
    JobSucceeded,
    JobFailed,
    /// The console reset a finished gate
    Rerun,
    /// The console opened the gate by hand
    RemoteOpen,
    /// The console closed the gate by hand
    RemoteClosed,
}

impl GateState {
    pub fn from_run_state(state: RunState) -> Option<Self> {
        match state {
            RunState::Pending => Some(Self::Pending),
            RunState::Running => Some(Self::Running),
            RunState::Open => Some(Self::Open),
            RunState::Closed => Some(Self::Closed),
            RunState::Successful | RunState::Failed | RunState::Cancelled => None,
        }
    }

    pub fn run_state(&self) -> RunState {
        match self {
            Self::Pending => RunState::Pending,
            Self::Running => RunState::Running,
            Self::Open => RunState::Open,
            Self::Closed => RunState::Closed,
        }
    }

    pub fn is_decided(&self) -> bool {
        matches!(self, Self::Open | Self::Closed)
    }

    /// Apply an event
    pub fn transition(self, event: GateEvent) -> Result<GateState, JobError> {
        use GateEvent::*;
        use GateState::*;

        let next = match (self, event) {
            (Pending, JobCreated) => Running,
            (Running, JobSucceeded) => Open,
            (Running, JobFailed) => Closed,
            (Open | Closed, Rerun) => Pending,
            (_, RemoteOpen) => Open,
            (_, RemoteClosed) => Closed,
            (from, event) => {
                return Err(JobError::IllegalTransition {
                    from: from.to_string(),
                    event: format!("{:?}", event),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.run_state(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::GateEvent::*;
    use super::GateState::*;
    use super::*;

    #[test]
    fn happy_path_opens() {
        let s = Pending.transition(JobCreated).unwrap();
        assert_eq!(s, Running);
        assert_eq!(s.transition(JobSucceeded).unwrap(), Open);
    }

    #[test]
    fn failed_job_closes() {
        assert_eq!(Running.transition(JobFailed).unwrap(), Closed);
    }

    #[test]
    fn rerun_reopens_decided_gates_only() {
        assert_eq!(Open.transition(Rerun).unwrap(), Pending);
        assert_eq!(Closed.transition(Rerun).unwrap(), Pending);
        assert!(Pending.transition(Rerun).is_err());
        assert!(Running.transition(Rerun).is_err());
    }

    #[test]
    fn remote_decision_always_wins() {
        assert_eq!(Running.transition(RemoteClosed).unwrap(), Closed);
        assert_eq!(Pending.transition(RemoteOpen).unwrap(), Open);
        assert_eq!(Closed.transition(RemoteClosed).unwrap(), Closed);
        assert_eq!(Open.transition(RemoteClosed).unwrap(), Closed);
    }

    #[test]
    fn job_events_require_a_running_gate() {
        for from in [Pending, Open, Closed] {
            let err = from.transition(JobSucceeded).unwrap_err();
            assert!(matches!(err, JobError::IllegalTransition { .. }));
        }
        assert!(Running.transition(JobCreated).is_err());
    }

    #[test]
    fn maps_to_and_from_run_states() {
        for s in [Pending, Running, Open, Closed] {
            assert_eq!(GateState::from_run_state(s.run_state()), Some(s));
        }
        assert_eq!(GateState::from_run_state(RunState::Successful), None);
        assert!(Open.is_decided());
        assert!(!Running.is_decided());
    }
}
