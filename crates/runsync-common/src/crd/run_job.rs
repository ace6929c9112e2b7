//! RunJob CRD types
//!
//! A `RunJob` is the local mirror of one remote run. It records which Job was
//! created for the run, the content hash of the Job's mutable fields, and the
//! last status observed and reported.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer held on every RunJob until its Job and Secret are gone
pub const RUN_JOB_FINALIZER: &str = "runjobs.runsync.plural.sh/finalizer";

/// Label carried by every object the operator creates for a run
pub const RUN_ID_LABEL: &str = "runsync.plural.sh/run-id";

// =============================================================================
// Run kind
// =============================================================================

/// Kind of remote run
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum RunKind {
    /// Pipeline gate
    Gate,
    /// Infrastructure stack run
    Stack,
    /// Sentinel (health check) run
    Sentinel,
}

impl RunKind {
    /// All kinds, in controller start order
    pub const ALL: [RunKind; 3] = [RunKind::Gate, RunKind::Stack, RunKind::Sentinel];

    /// Prefix for deterministic object names
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Gate => "gate",
            Self::Stack => "stack",
            Self::Sentinel => "sentinel",
        }
    }

    /// Name of the RunJob, Job and Secret for a run id
    pub fn resource_name(&self, id: &str) -> String {
        format!("{}-{}", self.prefix(), id)
    }
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gate => write!(f, "Gate"),
            Self::Stack => write!(f, "Stack"),
            Self::Sentinel => write!(f, "Sentinel"),
        }
    }
}

// =============================================================================
// Run state
// =============================================================================

/// Status of a run as the remote control plane sees it
///
/// Gates move through Pending, Running, Open and Closed; stack and sentinel
/// runs through Pending, Running and one of Successful, Failed or Cancelled.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Running,
    Successful,
    Failed,
    Cancelled,
    Open,
    Closed,
}

impl RunState {
    /// True for end states of stack and sentinel runs
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Successful | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Successful => "Successful",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
            Self::Open => "Open",
            Self::Closed => "Closed",
        };
        f.write_str(s)
    }
}

// =============================================================================
// RunJob
// =============================================================================

/// Specification for a RunJob
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "runsync.plural.sh",
    version = "v1alpha1",
    kind = "RunJob",
    plural = "runjobs",
    shortname = "rj",
    namespaced,
    status = "RunJobStatus",
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.kind"}"#,
    printcolumn = r#"{"name":"Run","type":"string","jsonPath":".spec.runId"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Job","type":"string","jsonPath":".status.jobRef.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RunJobSpec {
    /// Remote run id
    pub run_id: String,
    /// Kind of the remote run
    pub kind: RunKind,
    /// Namespace of the run's Job and Secret when it differs from the
    /// RunJob's own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
}

/// Reference to the Job executing a run
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct JobRef {
    pub name: String,
    pub namespace: String,
}

/// Observed state of a RunJob
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunJobStatus {
    /// Local view of the run state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RunState>,

    /// Job created for the run, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_ref: Option<JobRef>,

    /// Content hash of the Job's mutable fields as last applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,

    /// Last classification of the Job (Active, Succeeded, Failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_status: Option<String>,

    /// Last state reported upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<RunState>,
}

impl RunJob {
    /// Status, or the empty status for a RunJob not yet reconciled
    pub fn status_or_default(&self) -> RunJobStatus {
        self.status.clone().unwrap_or_default()
    }

    /// True when the finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|s| s == RUN_JOB_FINALIZER))
    }
}
