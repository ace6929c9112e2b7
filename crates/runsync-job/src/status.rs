//! Job and pod status classification

use std::fmt;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use runsync_console::{RunKind, RunState};

use crate::compiler::DEFAULT_CONTAINER;

/// Observed phase of a Job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobPhase {
    Active,
    Succeeded,
    Failed,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Active" => Some(Self::Active),
            "Succeeded" => Some(Self::Succeeded),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn condition_true(job: &Job, kind: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == kind && c.status == "True")
        })
}

/// Classify a Job by its Complete/Failed conditions
pub fn job_phase(job: &Job) -> JobPhase {
    if condition_true(job, "Failed") {
        JobPhase::Failed
    } else if condition_true(job, "Complete") {
        JobPhase::Succeeded
    } else {
        JobPhase::Active
    }
}

/// Run state for a terminated tool process
pub fn exit_code_state(code: i32) -> RunState {
    match code {
        64 | 66 => RunState::Cancelled,
        _ => RunState::Failed,
    }
}

/// Exit code of the terminated default container in any of the pods
pub fn default_container_exit_code(pods: &[Pod]) -> Option<i32> {
    pods.iter()
        .filter_map(|p| p.status.as_ref()?.container_statuses.as_ref())
        .flatten()
        .filter(|cs| cs.name == DEFAULT_CONTAINER)
        .find_map(|cs| {
            cs.state
                .as_ref()
                .and_then(|s| s.terminated.as_ref())
                .map(|t| t.exit_code)
        })
}

/// Run state for a stack or sentinel run given its Job phase
///
/// Failed stack runs look at the default container's exit code to tell a
/// cancellation from a failure; sentinels always report Failed.
pub fn run_state(kind: RunKind, phase: JobPhase, pods: &[Pod]) -> RunState {
    match phase {
        JobPhase::Active => RunState::Running,
        JobPhase::Succeeded => RunState::Successful,
        JobPhase::Failed => match kind {
            RunKind::Stack => default_container_exit_code(pods)
                .map(exit_code_state)
                .unwrap_or(RunState::Failed),
            RunKind::Sentinel | RunKind::Gate => RunState::Failed,
        },
    }
}
