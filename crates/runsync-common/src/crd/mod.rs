//! Custom resource definitions

mod run_job;

pub use run_job::{
    JobRef, RunJob, RunJobSpec, RunJobStatus, RunKind, RunState, RUN_ID_LABEL, RUN_JOB_FINALIZER,
};
