//! Run records as the console describes them

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use runsync_common::crd::{JobRef, RunKind, RunState};

/// A remote run: the source of truth a local Job is synced against
#[derive(Clone, Debug, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub kind: RunKind,
    pub status: RunState,
    /// Declared job specification, if the run has one
    pub job_spec: Option<JobSpecSource>,
    /// CPU/memory declared for the run's containers
    pub resources: Option<RunResources>,
    /// Output format hint passed to sentinel runs
    pub output_format: Option<String>,
    /// When the run started executing
    pub start_time: Option<DateTime<Utc>>,
    /// Execution image overrides
    pub image: ImageSettings,
    /// Steps of a stack run; empty for other kinds
    pub steps: Vec<RunStep>,
}

impl RunRecord {
    /// A bare pending record; tests and callers fill in the rest
    pub fn new(kind: RunKind, id: impl Into<String>, status: RunState) -> Self {
        Self {
            id: id.into(),
            kind,
            status,
            job_spec: None,
            resources: None,
            output_format: None,
            start_time: None,
            image: ImageSettings::default(),
            steps: Vec::new(),
        }
    }

    /// Step updates that settle unfinished steps once the run reached `state`
    pub fn step_updates(&self, state: RunState) -> Vec<(String, StepStatus)> {
        self.steps
            .iter()
            .filter_map(|step| Some((step.id.clone(), step.settled_by(state)?)))
            .collect()
    }

    /// Records that need no further work
    ///
    /// Finished stack and sentinel runs are ignorable. Gates never are: an
    /// Open or Closed gate can still be reopened for a rerun.
    pub fn is_ignorable(&self) -> bool {
        match self.kind {
            RunKind::Gate => false,
            RunKind::Stack | RunKind::Sentinel => self.status.is_terminal(),
        }
    }
}

/// Status of one stack run step
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Successful,
    Failed,
}

impl StepStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Successful => "SUCCESSFUL",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One step of a stack run
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RunStep {
    pub id: String,
    pub status: StepStatus,
}

impl RunStep {
    /// Final status for an unfinished step of a run in `state`
    ///
    /// A successful run completes its open steps; a failed or cancelled run
    /// fails them. Finished steps and unfinished runs yield `None`.
    pub fn settled_by(&self, state: RunState) -> Option<StepStatus> {
        if self.status.is_finished() {
            return None;
        }
        match state {
            RunState::Successful => Some(StepStatus::Successful),
            RunState::Failed | RunState::Cancelled => Some(StepStatus::Failed),
            _ => None,
        }
    }
}

/// How a run declares its job
#[derive(Clone, Debug, PartialEq)]
pub enum JobSpecSource {
    /// A serialized batch/v1 JobSpec (YAML or JSON)
    Raw(String),
    /// Individual fields from the console form
    Structured(StructuredJobSpec),
}

/// Job fields declared one by one
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredJobSpec {
    /// Namespace the Job should run in; honored for sentinel runs
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub service_account: Option<String>,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

/// A declared container
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Names of secrets to load as environment
    #[serde(default)]
    pub env_from: Vec<String>,
}

/// Requests and limits declared for a run
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct RunResources {
    #[serde(default)]
    pub requests: Option<ResourceValues>,
    #[serde(default)]
    pub limits: Option<ResourceValues>,
}

/// CPU/memory quantities as strings, validated when the Job is built
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ResourceValues {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
}

/// Image overrides carried by a run
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ImageSettings {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Tool type, e.g. TERRAFORM or ANSIBLE
    #[serde(default, rename = "type")]
    pub tool: Option<String>,
}

/// Status update sent upstream
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusAttributes {
    pub status: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_ref: Option<JobRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusAttributes {
    pub fn new(status: RunState) -> Self {
        Self {
            status,
            job_ref: None,
            error: None,
        }
    }

    pub fn with_job_ref(mut self, job_ref: JobRef) -> Self {
        self.job_ref = Some(job_ref);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Cursor position after a page
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    #[serde(rename = "hasNextPage")]
    pub has_next: bool,
    pub end_cursor: Option<String>,
}

/// One page of runs
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    pub items: Vec<RunRecord>,
    pub page_info: PageInfo,
}
