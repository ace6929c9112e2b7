//! Mutable Job fields and their content hash
//!
//! A Job's identity is fixed at creation. Only the fields listed here are ever
//! compared or copied onto an existing Job; everything else on the live
//! object is left as the API server has it.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EnvFromSource, EnvVar, ResourceRequirements, Toleration,
    Volume, VolumeMount,
};
use runsync_common::hash::content_hash;
use serde::Serialize;

use crate::error::JobError;

/// Allow-listed pod template fields of a Job
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutableFields {
    pub volumes: Option<Vec<Volume>>,
    pub service_account_name: Option<String>,
    pub affinity: Option<Affinity>,
    pub tolerations: Option<Vec<Toleration>>,
    pub containers: Vec<ContainerFields>,
}

/// Allow-listed fields of one container
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerFields {
    pub name: String,
    pub image: Option<String>,
    pub working_dir: Option<String>,
    pub ports: Option<Vec<ContainerPort>>,
    pub env: Option<Vec<EnvVar>>,
    pub env_from: Option<Vec<EnvFromSource>>,
    pub resources: Option<ResourceRequirements>,
    pub volume_mounts: Option<Vec<VolumeMount>>,
}

impl ContainerFields {
    fn from_container(c: &Container) -> Self {
        Self {
            name: c.name.clone(),
            image: c.image.clone(),
            working_dir: c.working_dir.clone(),
            ports: c.ports.clone(),
            env: c.env.clone(),
            env_from: c.env_from.clone(),
            resources: c.resources.clone(),
            volume_mounts: c.volume_mounts.clone(),
        }
    }

    fn apply_to(&self, c: &mut Container) {
        c.image = self.image.clone();
        c.working_dir = self.working_dir.clone();
        c.ports = self.ports.clone();
        c.env = self.env.clone();
        c.env_from = self.env_from.clone();
        c.resources = self.resources.clone();
        c.volume_mounts = self.volume_mounts.clone();
    }
}

impl MutableFields {
    /// Extract the allow-listed fields from a Job
    pub fn from_job(job: &Job) -> Self {
        let Some(pod) = job.spec.as_ref().and_then(|s| s.template.spec.as_ref()) else {
            return Self::default();
        };
        Self {
            volumes: pod.volumes.clone(),
            service_account_name: pod.service_account_name.clone(),
            affinity: pod.affinity.clone(),
            tolerations: pod.tolerations.clone(),
            containers: pod
                .containers
                .iter()
                .map(ContainerFields::from_container)
                .collect(),
        }
    }

    /// Copy these fields onto an existing Job
    ///
    /// Containers are matched by name. A container missing from the Job is
    /// added; a container not listed here is dropped.
    pub fn apply_to(&self, job: &mut Job) {
        let spec = job.spec.get_or_insert_with(Default::default);
        let pod = spec.template.spec.get_or_insert_with(Default::default);

        pod.volumes = self.volumes.clone();
        pod.service_account_name = self.service_account_name.clone();
        pod.affinity = self.affinity.clone();
        pod.tolerations = self.tolerations.clone();

        let mut existing = std::mem::take(&mut pod.containers);
        pod.containers = self
            .containers
            .iter()
            .map(|fields| {
                let mut container = match existing.iter().position(|c| c.name == fields.name) {
                    Some(i) => existing.swap_remove(i),
                    None => Container {
                        name: fields.name.clone(),
                        ..Default::default()
                    },
                };
                fields.apply_to(&mut container);
                container
            })
            .collect();
    }

    pub fn hash(&self) -> Result<String, JobError> {
        Ok(content_hash(self)?)
    }
}

/// Content hash of a Job's mutable fields
pub fn job_hash(job: &Job) -> Result<String, JobError> {
    MutableFields::from_job(job).hash()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{PodSpec, SecurityContext};
    use runsync_console::{RunKind, RunRecord, RunState};

    use super::*;
    use crate::compiler::{build_job, ImageDefaults};

    fn job() -> Job {
        let record = RunRecord::new(RunKind::Stack, "1", RunState::Pending);
        build_job(&record, "ns", &ImageDefaults::default()).unwrap()
    }

    fn pod_mut(job: &mut Job) -> &mut PodSpec {
        job.spec.as_mut().unwrap().template.spec.as_mut().unwrap()
    }

    #[test]
    fn hash_ignores_fields_outside_the_allow_list() {
        let original = job();
        let mut changed = original.clone();
        pod_mut(&mut changed).containers[0].security_context = Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        });
        changed.metadata.resource_version = Some("99".to_string());
        pod_mut(&mut changed).restart_policy = Some("OnFailure".to_string());

        assert_eq!(job_hash(&original).unwrap(), job_hash(&changed).unwrap());
    }

    #[test]
    fn hash_follows_allow_listed_fields() {
        let original = job();
        let mut changed = original.clone();
        pod_mut(&mut changed).containers[0].image = Some("other:1".to_string());
        assert_ne!(job_hash(&original).unwrap(), job_hash(&changed).unwrap());

        let mut changed = original.clone();
        pod_mut(&mut changed).service_account_name = Some("runner".to_string());
        assert_ne!(job_hash(&original).unwrap(), job_hash(&changed).unwrap());
    }

    #[test]
    fn apply_copies_only_allow_listed_fields() {
        let desired = job();
        let mut live = desired.clone();
        {
            let pod = pod_mut(&mut live);
            pod.containers[0].image = Some("stale:0".to_string());
            pod.containers[0].termination_message_path = Some("/dev/termination-log".to_string());
            pod.containers.push(Container {
                name: "sidecar".to_string(),
                ..Default::default()
            });
            pod.service_account_name = Some("old".to_string());
        }

        MutableFields::from_job(&desired).apply_to(&mut live);

        assert_eq!(job_hash(&live).unwrap(), job_hash(&desired).unwrap());
        let pod = live.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod.containers.len(), 1);
        // server-side defaults on the live container survive
        assert_eq!(
            pod.containers[0].termination_message_path.as_deref(),
            Some("/dev/termination-log")
        );
        assert!(pod.service_account_name.is_none());
    }
}
