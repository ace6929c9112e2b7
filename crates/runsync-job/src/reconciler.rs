//! Run reconciliation
//!
//! One [`RunReconciler`] serves every run kind. A pass:
//!
//! 1. ensures the RunJob mirror exists (finalizer included) and finalizes it
//!    when it is being deleted
//! 2. ensures the run's namespace and Secret, then builds the canonical Job
//!    and its hash
//! 3. creates (or adopts) the Job when none is recorded, else updates its
//!    mutable fields when the hash moved
//! 4. classifies the Job and reports state changes upstream, settling the
//!    open steps of finished stack runs
//! 5. persists the RunJob status only if something changed
//!
//! Stack and sentinel runs are fire-and-observe with a timeout ceiling. Gates
//! run through [`GateState`] and support rerun and abort. Optimistic-concurrency
//! conflicts anywhere in a pass end it with a short requeue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use kube::api::ObjectMeta;
use kube::{Client, ResourceExt};
use runsync_common::crd::{RunJob, RunJobSpec, RunJobStatus, RUN_ID_LABEL, RUN_JOB_FINALIZER};
use runsync_common::kube_utils::{create_or_adopt, ensure_namespace, is_terminating};
use runsync_common::metrics::{record_job_created, record_status_report};
use runsync_common::{KubeClients, KubeResourceClient, NamespacedClients, ResourceClient};
use runsync_console::{JobRef, RunKind, RunRecord, RunSource, RunState, StatusAttributes};
use runsync_engine::{Action, Reconcile};
use tracing::{debug, info, warn};

use crate::compiler::{build_job, run_namespace, ImageDefaults};
use crate::error::JobError;
use crate::fields::{job_hash, MutableFields};
use crate::gate::{GateEvent, GateState};
use crate::secret::SecretProvisioner;
use crate::status::{job_phase, run_state, JobPhase};

/// Recheck interval while a Job is running
pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(15);
/// Retry delay after an optimistic-concurrency conflict
pub const CONFLICT_DELAY: Duration = Duration::from_secs(2);
/// Wait for a deleted Job with the same name to go away
pub const TERMINATING_DELAY: Duration = Duration::from_secs(5);
/// Delay before retiring a run whose final state was just reported
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);

// =============================================================================
// Context
// =============================================================================

/// Everything a reconciliation pass needs
pub struct JobContext {
    /// Home of the RunJobs and of every Job not placed elsewhere
    pub namespace: String,
    pub provisioner: SecretProvisioner,
    pub images: ImageDefaults,
    /// Ceiling on how long a stack or sentinel run may stay unfinished
    pub run_timeout: Duration,
    pub source: Arc<dyn RunSource>,
    pub jobs: Arc<dyn NamespacedClients<Job>>,
    pub secrets: Arc<dyn NamespacedClients<Secret>>,
    pub pods: Arc<dyn NamespacedClients<Pod>>,
    pub namespaces: Arc<dyn ResourceClient<Namespace>>,
    pub run_jobs: Arc<dyn ResourceClient<RunJob>>,
}

impl JobContext {
    /// Context backed by the cluster with RunJobs in `namespace`
    pub fn new(
        client: Client,
        namespace: &str,
        provisioner: SecretProvisioner,
        images: ImageDefaults,
        run_timeout: Duration,
        source: Arc<dyn RunSource>,
    ) -> Self {
        let clients = KubeClients::new(client.clone());
        Self {
            namespace: namespace.to_string(),
            provisioner,
            images,
            run_timeout,
            source,
            jobs: Arc::new(clients.clone()),
            secrets: Arc::new(clients.clone()),
            pods: Arc::new(clients),
            namespaces: Arc::new(KubeResourceClient::cluster(client.clone())),
            run_jobs: Arc::new(KubeResourceClient::namespaced(client, namespace)),
        }
    }

    /// Namespace holding a run's Job and Secret: where its Job was created,
    /// else where it was meant to go when the RunJob was created
    fn target_namespace(&self, run_job: &RunJob) -> String {
        run_job
            .status
            .as_ref()
            .and_then(|s| s.job_ref.as_ref())
            .map(|r| r.namespace.clone())
            .or_else(|| run_job.spec.target_namespace.clone())
            .unwrap_or_else(|| self.namespace.clone())
    }

    fn scope(&self, namespace: &str) -> RunScope {
        RunScope {
            namespace: namespace.to_string(),
            jobs: self.jobs.in_namespace(namespace),
            secrets: self.secrets.in_namespace(namespace),
            pods: self.pods.in_namespace(namespace),
        }
    }
}

/// Clients bound to the namespace of one run's Job and Secret
struct RunScope {
    namespace: String,
    jobs: Arc<dyn ResourceClient<Job>>,
    secrets: Arc<dyn ResourceClient<Secret>>,
    pods: Arc<dyn ResourceClient<Pod>>,
}

/// Outcome of bringing the Job in line with the record
enum JobSync {
    Ready(Job),
    Retry(Action),
}

/// A Job was recorded and not last seen finished
fn job_unfinished(status: &RunJobStatus) -> bool {
    let finished = status
        .job_status
        .as_deref()
        .and_then(JobPhase::parse)
        .is_some_and(|p| p.is_finished());
    status.job_ref.is_some() && !finished
}

// =============================================================================
// Reconciler
// =============================================================================

/// Syncs one remote run onto its RunJob, Secret and Job
pub struct RunReconciler {
    ctx: Arc<JobContext>,
}

impl RunReconciler {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }

    async fn pass(&self, record: &RunRecord) -> Result<Action, JobError> {
        let name = record.kind.resource_name(&record.id);
        let run_job = self.ensure_run_job(record, &name).await?;
        if is_terminating(&run_job) {
            info!(run_job = %name, "run job deleted, cleaning up");
            self.finalize(&run_job, true).await?;
            return Ok(Action::await_change());
        }

        let scope = self.ctx.scope(&self.ctx.target_namespace(&run_job));
        let before = run_job.status_or_default();
        let mut status = before.clone();
        let result = match record.kind {
            RunKind::Gate => self.reconcile_gate(record, &name, &scope, &mut status).await,
            RunKind::Stack | RunKind::Sentinel => {
                self.reconcile_run(record, &name, &scope, &run_job, &mut status)
                    .await
            }
        };

        // persist whatever was done before a failure so the next pass
        // does not redo it
        if status != before {
            debug!(run_job = %name, state = ?status.state, "persisting status");
            self.ctx
                .run_jobs
                .patch_status(&name, status_patch(&status))
                .await?;
        }
        let action = result?;
        Ok(if status.reported != before.reported {
            action.with_refresh()
        } else {
            action
        })
    }

    /// Get the RunJob for a run, creating it with the finalizer if absent
    async fn ensure_run_job(&self, record: &RunRecord, name: &str) -> Result<RunJob, JobError> {
        if let Some(mut existing) = self.ctx.run_jobs.get(name).await? {
            if existing.has_finalizer() || is_terminating(&existing) {
                return Ok(existing);
            }
            existing
                .finalizers_mut()
                .push(RUN_JOB_FINALIZER.to_string());
            return Ok(self.ctx.run_jobs.update(&existing).await?);
        }

        let target = run_namespace(record, &self.ctx.namespace);
        let mut run_job = RunJob::new(
            name,
            RunJobSpec {
                run_id: record.id.clone(),
                kind: record.kind,
                target_namespace: (target != self.ctx.namespace).then_some(target),
            },
        );
        run_job.metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.ctx.namespace.clone()),
            finalizers: Some(vec![RUN_JOB_FINALIZER.to_string()]),
            labels: Some([(RUN_ID_LABEL.to_string(), record.id.clone())].into()),
            ..Default::default()
        };
        info!(run_job = %name, kind = %record.kind, "tracking new run");
        Ok(create_or_adopt(self.ctx.run_jobs.as_ref(), &run_job, name).await?)
    }

    // =========================================================================
    // Stack and sentinel runs
    // =========================================================================

    async fn reconcile_run(
        &self,
        record: &RunRecord,
        name: &str,
        scope: &RunScope,
        run_job: &RunJob,
        status: &mut RunJobStatus,
    ) -> Result<Action, JobError> {
        if status.reported.is_some_and(|s| s.is_terminal()) {
            // a Job still running here was left behind by a timeout
            let job_active = job_unfinished(status);
            debug!(run_job = %name, job_active, "final state reported, retiring");
            self.finalize(run_job, job_active).await?;
            return Ok(Action::await_change());
        }

        if self.timed_out(record) {
            warn!(run_job = %name, timeout_secs = self.ctx.run_timeout.as_secs(), "run timed out");
            if let Some(job_ref) = &status.job_ref {
                if let Err(e) = scope.jobs.delete(&job_ref.name).await {
                    warn!(job = %job_ref.name, error = %e, "failed to delete timed out job");
                }
            }
            let message = format!(
                "run did not finish within {}s",
                self.ctx.run_timeout.as_secs()
            );
            self.report(record, status, RunState::Failed, Some(message))
                .await?;
            status.state = Some(RunState::Failed);
            return Ok(Action::requeue(SETTLE_DELAY));
        }

        let job = match self.sync_job(record, name, scope, status).await {
            Ok(JobSync::Ready(job)) => job,
            Ok(JobSync::Retry(action)) => return Ok(action),
            Err(e) if e.is_validation() => {
                warn!(run_job = %name, error = %e, "run cannot be turned into a job");
                self.report(record, status, RunState::Failed, Some(e.to_string()))
                    .await?;
                status.state = Some(RunState::Failed);
                return Ok(Action::requeue(SETTLE_DELAY));
            }
            Err(e) => return Err(e),
        };

        let phase = job_phase(&job);
        status.job_status = Some(phase.to_string());
        let pods = if phase == JobPhase::Failed && record.kind == RunKind::Stack {
            scope.pods.list(&format!("job-name={}", job.name_any())).await?
        } else {
            Vec::new()
        };
        let state = run_state(record.kind, phase, &pods);
        self.report(record, status, state, None).await?;
        status.state = Some(state);

        Ok(if state.is_terminal() {
            info!(run_job = %name, %state, "run finished");
            Action::requeue(SETTLE_DELAY)
        } else {
            Action::requeue(JOB_POLL_INTERVAL)
        })
    }

    fn timed_out(&self, record: &RunRecord) -> bool {
        let Some(start) = record.start_time else {
            return false;
        };
        chrono::Duration::from_std(self.ctx.run_timeout)
            .is_ok_and(|limit| Utc::now().signed_duration_since(start) > limit)
    }

    // =========================================================================
    // Gates
    // =========================================================================

    async fn reconcile_gate(
        &self,
        record: &RunRecord,
        name: &str,
        scope: &RunScope,
        status: &mut RunJobStatus,
    ) -> Result<Action, JobError> {
        let Some(remote) = GateState::from_run_state(record.status) else {
            warn!(run_job = %name, status = %record.status, "gate in a run-only state, ignoring");
            return Ok(Action::await_change());
        };
        let mut local = status
            .state
            .and_then(GateState::from_run_state)
            .unwrap_or(GateState::Pending);
        let synced = status.reported == Some(local.run_state());

        if remote.is_decided() && remote != local {
            // decided upstream: abort whatever runs locally
            let event = match remote {
                GateState::Open => GateEvent::RemoteOpen,
                _ => GateEvent::RemoteClosed,
            };
            if !local.is_decided() {
                info!(run_job = %name, %remote, "gate decided upstream, aborting job");
                if let Some(job_ref) = &status.job_ref {
                    if let Err(e) = scope.jobs.delete(&job_ref.name).await {
                        warn!(job = %job_ref.name, error = %e, "failed to delete aborted job");
                    }
                }
            }
            local = local.transition(event)?;
            status.state = Some(local.run_state());
            status.reported = Some(local.run_state());
            return Ok(Action::await_change());
        }

        if local.is_decided() {
            if !synced {
                self.report(record, status, local.run_state(), None).await?;
                return Ok(Action::await_change());
            }
            if remote.is_decided() {
                return Ok(Action::await_change());
            }
            info!(run_job = %name, "gate reset upstream, rerunning");
            if let Some(job_ref) = status.job_ref.take() {
                scope.jobs.delete(&job_ref.name).await?;
            }
            local = local.transition(GateEvent::Rerun)?;
            status.state = Some(local.run_state());
            status.sha = None;
            status.job_status = None;
            status.reported = None;
        }

        let job = match self.sync_job(record, name, scope, status).await {
            Ok(JobSync::Ready(job)) => job,
            Ok(JobSync::Retry(action)) => return Ok(action),
            Err(e) if e.is_validation() => {
                warn!(run_job = %name, error = %e, "gate cannot be turned into a job");
                status.state = Some(RunState::Closed);
                self.report(record, status, RunState::Closed, Some(e.to_string()))
                    .await?;
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e),
        };

        if local == GateState::Pending {
            local = local.transition(GateEvent::JobCreated)?;
            status.state = Some(local.run_state());
            self.report(record, status, RunState::Pending, None).await?;
        }

        let phase = job_phase(&job);
        status.job_status = Some(phase.to_string());
        let event = match phase {
            JobPhase::Active => return Ok(Action::requeue(JOB_POLL_INTERVAL)),
            JobPhase::Succeeded => GateEvent::JobSucceeded,
            JobPhase::Failed => GateEvent::JobFailed,
        };
        local = local.transition(event)?;
        info!(run_job = %name, state = %local, "gate decided");
        status.state = Some(local.run_state());
        self.report(record, status, local.run_state(), None).await?;
        Ok(Action::await_change())
    }

    // =========================================================================
    // Shared steps
    // =========================================================================

    /// Ensure the namespace and Secret, then create, adopt or update the Job
    async fn sync_job(
        &self,
        record: &RunRecord,
        name: &str,
        scope: &RunScope,
        status: &mut RunJobStatus,
    ) -> Result<JobSync, JobError> {
        let ctx = &self.ctx;
        if scope.namespace != ctx.namespace {
            ensure_namespace(ctx.namespaces.as_ref(), &scope.namespace).await?;
        }
        let secret = ctx
            .provisioner
            .ensure(scope.secrets.as_ref(), record, &scope.namespace)
            .await?;
        let desired = build_job(record, &scope.namespace, &ctx.images)?;
        let sha = job_hash(&desired)?;

        let Some(job_ref) = status.job_ref.clone() else {
            let job = match scope.jobs.get(name).await? {
                Some(existing) => {
                    if is_terminating(&existing) {
                        debug!(job = %name, "previous job still terminating");
                        return Ok(JobSync::Retry(Action::requeue(TERMINATING_DELAY)));
                    }
                    debug!(job = %name, "adopting existing job");
                    existing
                }
                None => {
                    info!(job = %name, namespace = %scope.namespace, "creating job");
                    let job = create_or_adopt(scope.jobs.as_ref(), &desired, name).await?;
                    record_job_created(record.kind.prefix());
                    job
                }
            };
            ctx.provisioner
                .attach_owner(scope.secrets.as_ref(), &secret, &job)
                .await?;
            status.job_ref = Some(JobRef {
                name: name.to_string(),
                namespace: scope.namespace.clone(),
            });
            // an adopted job is checked against the desired fields below
            status.sha = (job_hash(&job)? == sha).then_some(sha.clone());
            if status.sha.is_some() {
                return Ok(JobSync::Ready(job));
            }
            return self.update_job(scope, job, &desired, sha, status).await;
        };

        let Some(job) = scope.jobs.get(&job_ref.name).await? else {
            warn!(job = %job_ref.name, "recorded job is gone, recreating");
            status.job_ref = None;
            status.sha = None;
            status.job_status = None;
            return Ok(JobSync::Retry(Action::requeue(CONFLICT_DELAY)));
        };
        if status.sha.as_deref() == Some(sha.as_str()) {
            return Ok(JobSync::Ready(job));
        }
        self.update_job(scope, job, &desired, sha, status).await
    }

    async fn update_job(
        &self,
        scope: &RunScope,
        mut job: Job,
        desired: &Job,
        sha: String,
        status: &mut RunJobStatus,
    ) -> Result<JobSync, JobError> {
        info!(job = %job.name_any(), "job spec changed, updating");
        MutableFields::from_job(desired).apply_to(&mut job);
        match scope.jobs.update(&job).await {
            Ok(updated) => {
                status.sha = Some(sha);
                Ok(JobSync::Ready(updated))
            }
            Err(e) if e.is_conflict() => {
                debug!(job = %job.name_any(), "conflict updating job, retrying");
                Ok(JobSync::Retry(Action::requeue(CONFLICT_DELAY)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Report a state upstream unless it was already reported
    ///
    /// A final stack state also settles the run's open steps.
    async fn report(
        &self,
        record: &RunRecord,
        status: &mut RunJobStatus,
        state: RunState,
        error: Option<String>,
    ) -> Result<(), JobError> {
        if status.reported == Some(state) {
            return Ok(());
        }
        let mut attrs = StatusAttributes::new(state);
        if let Some(job_ref) = &status.job_ref {
            attrs = attrs.with_job_ref(job_ref.clone());
        }
        if let Some(error) = error {
            attrs = attrs.with_error(error);
        }
        self.ctx
            .source
            .update_run_status(record.kind, &record.id, attrs)
            .await?;
        info!(kind = %record.kind, run = %record.id, %state, "reported run state");
        record_status_report(record.kind.prefix(), &state.to_string());

        if record.kind == RunKind::Stack {
            for (step, step_status) in record.step_updates(state) {
                self.ctx.source.update_run_step(&step, step_status).await?;
                debug!(run = %record.id, %step, status = %step_status, "settled step");
            }
        }
        status.reported = Some(state);
        Ok(())
    }

    /// Optionally tear down the Job and Secret, then release and delete the
    /// RunJob
    async fn finalize(&self, run_job: &RunJob, delete_job: bool) -> Result<(), JobError> {
        let name = run_job.name_any();
        if delete_job {
            let scope = self.ctx.scope(&self.ctx.target_namespace(run_job));
            let job_name = run_job
                .status
                .as_ref()
                .and_then(|s| s.job_ref.as_ref())
                .map_or_else(|| name.clone(), |r| r.name.clone());
            scope.jobs.delete(&job_name).await?;
            scope.secrets.delete(&name).await?;
        }

        if run_job.has_finalizer() {
            let mut released = run_job.clone();
            released
                .finalizers_mut()
                .retain(|f| f != RUN_JOB_FINALIZER);
            self.ctx.run_jobs.update(&released).await?;
        }
        if !is_terminating(run_job) {
            self.ctx.run_jobs.delete(&name).await?;
        }
        info!(run_job = %name, delete_job, "run retired");
        Ok(())
    }
}

/// Merge patch writing every status field, with nulls clearing unset ones
fn status_patch(status: &RunJobStatus) -> serde_json::Value {
    serde_json::json!({
        "state": status.state,
        "jobRef": status.job_ref,
        "sha": status.sha,
        "jobStatus": status.job_status,
        "reported": status.reported,
    })
}

#[async_trait]
impl Reconcile for RunReconciler {
    type Error = JobError;

    async fn reconcile(&self, record: &RunRecord) -> Result<Action, JobError> {
        match self.pass(record).await {
            Err(e) if e.is_run_gone() => {
                info!(kind = %record.kind, run = %record.id, "run vanished while reporting");
                self.retire(record.kind, &record.id).await?;
                Ok(Action::await_change())
            }
            Err(e) if e.is_conflict() => {
                debug!(kind = %record.kind, run = %record.id, error = %e, "conflict, retrying");
                Ok(Action::requeue(CONFLICT_DELAY))
            }
            other => other,
        }
    }

    async fn retire(&self, kind: RunKind, id: &str) -> Result<(), JobError> {
        let name = kind.resource_name(id);
        let Some(run_job) = self.ctx.run_jobs.get(&name).await? else {
            return Ok(());
        };
        let job_active = job_unfinished(&run_job.status_or_default());
        self.finalize(&run_job, job_active).await
    }
}
