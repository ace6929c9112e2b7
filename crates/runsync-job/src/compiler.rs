//! Run to Job compilation
//!
//! Turns a run's declared job specification (absent, raw, or structured) into
//! one canonical `batch/v1` Job. Building is pure and deterministic: the same
//! record always yields the same Job, so repeated builds resolve to the same
//! object and the same content hash.
//!
//! Rules applied on top of whatever the run declared:
//! - the run always executes in a container named `default`; when none of the
//!   declared containers carries that name one is appended
//! - declared containers only get missing fields filled (image, env-from of
//!   the run secret, security context, resources); explicit values are kept
//! - the reserved `default` and `tmp` volumes and their mounts are replaced,
//!   never duplicated
//! - restart policy Never, backoff limit 0, one hour cleanup after finish

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvFromSource, EnvVar, PodSecurityContext, PodSpec,
    ResourceRequirements, SecretEnvSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use runsync_common::crd::RUN_ID_LABEL;
use runsync_console::{
    ImageSettings, JobSpecSource, ResourceValues, RunKind, RunRecord, RunResources,
    StructuredJobSpec,
};
use tracing::warn;

use crate::error::JobError;

/// Name of the container the run's tooling executes in
pub const DEFAULT_CONTAINER: &str = "default";
/// Pod annotation selecting the container `kubectl logs` attaches to
pub const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";
/// Label carrying the run kind
pub const RUN_KIND_LABEL: &str = "runsync.plural.sh/kind";

const WORK_VOLUME: &str = "default";
const WORK_MOUNT_PATH: &str = "/plural";
const TMP_VOLUME: &str = "tmp";
const TMP_MOUNT_PATH: &str = "/tmp";

const NON_ROOT_ID: i64 = 65532;
const TTL_SECONDS_AFTER_FINISHED: i32 = 60 * 60;

pub const DEFAULT_IMAGE: &str = "ghcr.io/pluralsh/harness";
pub const DEFAULT_IMAGE_TAG: &str = "0.6.18";

// =============================================================================
// Image resolution
// =============================================================================

/// Default execution image and per-tool versions
#[derive(Clone, Debug, PartialEq)]
pub struct ImageDefaults {
    pub image: String,
    pub tag: String,
    /// Default tool version keyed by lowercase tool type
    pub versions: BTreeMap<String, String>,
}

impl Default for ImageDefaults {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            tag: DEFAULT_IMAGE_TAG.to_string(),
            versions: BTreeMap::from([
                ("terraform".to_string(), "1.8.2".to_string()),
                ("ansible".to_string(), "latest".to_string()),
            ]),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl ImageDefaults {
    /// Resolve the execution image for a run
    ///
    /// 1. explicit tag: `<image or default image>:<tag>`
    /// 2. explicit image and version: `<image>:<version>`
    /// 3. explicit image: `<image>:<default tag>`
    /// 4. otherwise `<default image>:<default tag>-<tool>-<version>`, where the
    ///    version falls back to the tool's default; no tool means plain
    ///    `<default image>:<default tag>`
    pub fn resolve(&self, settings: &ImageSettings) -> String {
        let custom_image = non_empty(&settings.image);
        let version = non_empty(&settings.version);

        if let Some(tag) = non_empty(&settings.tag) {
            return format!("{}:{}", custom_image.unwrap_or(&self.image), tag);
        }
        if let (Some(image), Some(version)) = (custom_image, version) {
            return format!("{}:{}", image, version);
        }
        if let Some(image) = custom_image {
            return format!("{}:{}", image, self.tag);
        }

        let Some(tool) = non_empty(&settings.tool).map(str::to_lowercase) else {
            return format!("{}:{}", self.image, self.tag);
        };
        match version.or_else(|| self.versions.get(&tool).map(String::as_str)) {
            Some(version) => format!("{}:{}-{}-{}", self.image, self.tag, tool, version),
            None => format!("{}:{}-{}", self.image, self.tag, tool),
        }
    }
}

// =============================================================================
// Quantities
// =============================================================================

const QUANTITY_SUFFIXES: &[&str] = &[
    "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "n", "u", "m", "", "k", "M", "G", "T", "P", "E",
];

/// Check a resource quantity such as `500m`, `1.5`, `2Gi` or `1e3`
pub fn is_valid_quantity(value: &str) -> bool {
    let unsigned = value.strip_prefix(['+', '-']).unwrap_or(value);
    let digits_end = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(digits_end);

    let mut parts = number.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let frac = parts.next();
    let number_ok = match frac {
        Some(frac) => {
            !frac.contains('.') && (!whole.is_empty() || !frac.is_empty())
        }
        None => !whole.is_empty(),
    };
    if !number_ok {
        return false;
    }

    if QUANTITY_SUFFIXES.contains(&suffix) {
        return true;
    }
    // decimal exponent: e.g. 1e3, 2E-2
    let Some(exp) = suffix.strip_prefix(['e', 'E']) else {
        return false;
    };
    let exp = exp.strip_prefix(['+', '-']).unwrap_or(exp);
    !exp.is_empty() && exp.chars().all(|c| c.is_ascii_digit())
}

fn validate_resources(run_id: &str, resources: &RunResources) -> Result<(), JobError> {
    let groups = [("requests", &resources.requests), ("limits", &resources.limits)];
    for (group, values) in groups {
        let Some(values) = values else { continue };
        for (key, value) in [("cpu", &values.cpu), ("memory", &values.memory)] {
            if let Some(value) = value {
                if !is_valid_quantity(value) {
                    return Err(runsync_common::Error::validation_for_field(
                        run_id,
                        format!("resources.{}.{}", group, key),
                        format!("invalid quantity '{}'", value),
                    )
                    .into());
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Building
// =============================================================================

/// Build the canonical Job for a run
pub fn build_job(
    record: &RunRecord,
    namespace: &str,
    images: &ImageDefaults,
) -> Result<Job, JobError> {
    if let Some(resources) = &record.resources {
        validate_resources(&record.id, resources)?;
    }

    let name = record.kind.resource_name(&record.id);
    let image = images.resolve(&record.image);
    let mut spec = declared_spec(record);

    let template_meta = spec.template.metadata.get_or_insert_with(Default::default);
    template_meta
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(RUN_ID_LABEL.to_string(), record.id.clone());

    let pod = spec.template.spec.get_or_insert_with(Default::default);
    pod.restart_policy = Some("Never".to_string());

    if !pod.containers.iter().any(|c| c.name == DEFAULT_CONTAINER) {
        pod.containers.push(Container {
            name: DEFAULT_CONTAINER.to_string(),
            ..Default::default()
        });
    }

    for container in &mut pod.containers {
        patch_container(container, &image, &name, record.resources.as_ref());
    }
    pod.volumes = Some(with_reserved_volumes(pod.volumes.take()));
    if pod.security_context.is_none() {
        pod.security_context = Some(PodSecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(NON_ROOT_ID),
            run_as_group: Some(NON_ROOT_ID),
            ..Default::default()
        });
    }

    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(
            DEFAULT_CONTAINER_ANNOTATION.to_string(),
            DEFAULT_CONTAINER.to_string(),
        );

    spec.backoff_limit = Some(0);
    spec.ttl_seconds_after_finished = Some(TTL_SECONDS_AFTER_FINISHED);

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (RUN_ID_LABEL.to_string(), record.id.clone()),
                (RUN_KIND_LABEL.to_string(), record.kind.prefix().to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    })
}

/// Namespace a run's Job and Secret are created in
///
/// Sentinel runs may pick one through their declared pod template (or the
/// structured `namespace` field); everything else runs in `default`.
pub fn run_namespace(record: &RunRecord, default: &str) -> String {
    if record.kind != RunKind::Sentinel {
        return default.to_string();
    }
    let declared = match &record.job_spec {
        None => None,
        Some(JobSpecSource::Structured(s)) => s.namespace.clone(),
        Some(JobSpecSource::Raw(_)) => declared_spec(record)
            .template
            .metadata
            .and_then(|m| m.namespace),
    };
    declared
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// The JobSpec the run declared, or an empty one
fn declared_spec(record: &RunRecord) -> JobSpec {
    match &record.job_spec {
        None => JobSpec::default(),
        Some(JobSpecSource::Raw(raw)) => match serde_yaml::from_str::<JobSpec>(raw) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(
                    run = %record.id,
                    error = %e,
                    "malformed job spec, falling back to defaults"
                );
                JobSpec::default()
            }
        },
        Some(JobSpecSource::Structured(s)) => structured_spec(s),
    }
}

fn structured_spec(s: &StructuredJobSpec) -> JobSpec {
    let containers = s
        .containers
        .iter()
        .enumerate()
        .map(|(i, c)| Container {
            name: if i == 0 {
                DEFAULT_CONTAINER.to_string()
            } else {
                format!("container-{}", i)
            },
            image: c.image.clone(),
            args: (!c.args.is_empty()).then(|| c.args.clone()),
            env: (!c.env.is_empty()).then(|| {
                c.env
                    .iter()
                    .map(|(k, v)| EnvVar {
                        name: k.clone(),
                        value: Some(v.clone()),
                        ..Default::default()
                    })
                    .collect()
            }),
            env_from: (!c.env_from.is_empty())
                .then(|| c.env_from.iter().map(|s| secret_env_from(s)).collect()),
            ..Default::default()
        })
        .collect();

    let mut spec = JobSpec::default();
    spec.template.metadata = Some(ObjectMeta {
        labels: (!s.labels.is_empty()).then(|| s.labels.clone()),
        annotations: (!s.annotations.is_empty()).then(|| s.annotations.clone()),
        ..Default::default()
    });
    spec.template.spec = Some(PodSpec {
        containers,
        service_account_name: s.service_account.clone(),
        ..Default::default()
    });
    spec
}

fn secret_env_from(secret: &str) -> EnvFromSource {
    EnvFromSource {
        secret_ref: Some(SecretEnvSource {
            name: secret.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Fill what a container leaves unset; never overwrite explicit values
fn patch_container(
    container: &mut Container,
    image: &str,
    secret: &str,
    resources: Option<&RunResources>,
) {
    if container.image.as_deref().map_or(true, str::is_empty) {
        container.image = Some(image.to_string());
    }

    let env_from = container.env_from.get_or_insert_with(Vec::new);
    let has_run_secret = env_from
        .iter()
        .any(|e| e.secret_ref.as_ref().is_some_and(|s| s.name == secret));
    if !has_run_secret {
        env_from.push(secret_env_from(secret));
    }

    container.volume_mounts = Some(with_reserved_mounts(container.volume_mounts.take()));

    if container.security_context.is_none() {
        container.security_context = Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            read_only_root_filesystem: Some(false),
            run_as_non_root: Some(true),
            run_as_user: Some(NON_ROOT_ID),
            run_as_group: Some(NON_ROOT_ID),
            ..Default::default()
        });
    }

    if let Some(resources) = resources {
        apply_resources(container, resources);
    }
}

fn apply_resources(container: &mut Container, resources: &RunResources) {
    if resources.requests.is_none() && resources.limits.is_none() {
        return;
    }
    let reqs = container
        .resources
        .get_or_insert_with(ResourceRequirements::default);
    if let Some(values) = &resources.requests {
        fill_missing(reqs.requests.get_or_insert_with(BTreeMap::new), values);
    }
    if let Some(values) = &resources.limits {
        fill_missing(reqs.limits.get_or_insert_with(BTreeMap::new), values);
    }
}

fn fill_missing(target: &mut BTreeMap<String, Quantity>, values: &ResourceValues) {
    for (key, value) in [("cpu", &values.cpu), ("memory", &values.memory)] {
        if let Some(value) = value {
            target
                .entry(key.to_string())
                .or_insert_with(|| Quantity(value.clone()));
        }
    }
}

fn is_reserved(name: &str) -> bool {
    name == WORK_VOLUME || name == TMP_VOLUME
}

fn with_reserved_volumes(volumes: Option<Vec<Volume>>) -> Vec<Volume> {
    let mut volumes: Vec<Volume> = volumes
        .unwrap_or_default()
        .into_iter()
        .filter(|v| !is_reserved(&v.name))
        .collect();
    for name in [WORK_VOLUME, TMP_VOLUME] {
        volumes.push(Volume {
            name: name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
    }
    volumes
}

fn with_reserved_mounts(mounts: Option<Vec<VolumeMount>>) -> Vec<VolumeMount> {
    let mut mounts: Vec<VolumeMount> = mounts
        .unwrap_or_default()
        .into_iter()
        .filter(|m| !is_reserved(&m.name))
        .collect();
    for (name, path) in [(WORK_VOLUME, WORK_MOUNT_PATH), (TMP_VOLUME, TMP_MOUNT_PATH)] {
        mounts.push(VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            ..Default::default()
        });
    }
    mounts
}

#[cfg(test)]
mod tests {
    use runsync_console::{ContainerSpec, RunState};

    use super::*;

    fn record(kind: RunKind) -> RunRecord {
        RunRecord::new(kind, "42", RunState::Pending)
    }

    fn pod(job: &Job) -> &PodSpec {
        job.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
    }

    fn mount_names(c: &Container) -> Vec<&str> {
        c.volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.name.as_str())
            .collect()
    }

    // =========================================================================
    // Defaults
    // =========================================================================

    #[test]
    fn run_without_containers_gets_one_default_container() {
        let mut rec = record(RunKind::Stack);
        rec.image.tool = Some("TERRAFORM".to_string());
        let job = build_job(&rec, "runsync", &ImageDefaults::default()).unwrap();
        let pod = pod(&job);

        assert_eq!(pod.containers.len(), 1);
        let c = &pod.containers[0];
        assert_eq!(c.name, DEFAULT_CONTAINER);
        assert_eq!(
            c.image.as_deref(),
            Some("ghcr.io/pluralsh/harness:0.6.18-terraform-1.8.2")
        );
        assert_eq!(mount_names(c), vec!["default", "tmp"]);
        let secret = c.env_from.as_ref().unwrap()[0].secret_ref.as_ref().unwrap();
        assert_eq!(secret.name, "stack-42");
        let sc = c.security_context.as_ref().unwrap();
        assert_eq!(sc.allow_privilege_escalation, Some(false));
        assert_eq!(sc.run_as_user, Some(65532));
    }

    #[test]
    fn job_level_settings_are_fixed() {
        let job = build_job(&record(RunKind::Gate), "ns", &ImageDefaults::default()).unwrap();
        let spec = job.spec.as_ref().unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("gate-42"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("ns"));
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.ttl_seconds_after_finished, Some(3600));
        let pod = pod(&job);
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.security_context.as_ref().unwrap().run_as_group, Some(65532));
        let annotations = spec.template.metadata.as_ref().unwrap().annotations.as_ref().unwrap();
        assert_eq!(annotations[DEFAULT_CONTAINER_ANNOTATION], "default");
        let volumes: Vec<_> = pod.volumes.as_ref().unwrap().iter().map(|v| v.name.as_str()).collect();
        assert_eq!(volumes, vec!["default", "tmp"]);
    }

    #[test]
    fn builds_are_deterministic() {
        let mut rec = record(RunKind::Sentinel);
        rec.output_format = Some("JUNIT".to_string());
        let a = build_job(&rec, "ns", &ImageDefaults::default()).unwrap();
        let b = build_job(&rec, "ns", &ImageDefaults::default()).unwrap();
        assert_eq!(a, b);
    }

    // =========================================================================
    // Declared containers
    // =========================================================================

    #[test]
    fn explicit_container_keeps_image_and_env_and_gains_missing_fields() {
        let mut rec = record(RunKind::Gate);
        rec.job_spec = Some(JobSpecSource::Structured(StructuredJobSpec {
            containers: vec![ContainerSpec {
                image: Some("alpine:3.20".to_string()),
                env: BTreeMap::from([("MODE".to_string(), "check".to_string())]),
                ..Default::default()
            }],
            ..Default::default()
        }));

        let job = build_job(&rec, "ns", &ImageDefaults::default()).unwrap();
        let pod = pod(&job);
        assert_eq!(pod.containers.len(), 1);
        let c = &pod.containers[0];
        assert_eq!(c.image.as_deref(), Some("alpine:3.20"));
        let env = c.env.as_ref().unwrap();
        assert_eq!(env[0].name, "MODE");
        assert_eq!(env[0].value.as_deref(), Some("check"));
        assert!(c.security_context.is_some());
        assert_eq!(mount_names(c), vec!["default", "tmp"]);
    }

    #[test]
    fn raw_spec_security_context_and_env_from_are_preserved() {
        let raw = r#"
template:
  spec:
    securityContext:
      runAsUser: 1000
    volumes:
      - name: default
        hostPath:
          path: /var/data
      - name: cache
        emptyDir: {}
    containers:
      - name: worker
        image: busybox
        securityContext:
          privileged: true
        envFrom:
          - secretRef:
              name: stack-42
        volumeMounts:
          - name: tmp
            mountPath: /scratch
          - name: cache
            mountPath: /cache
"#;
        let mut rec = record(RunKind::Stack);
        rec.job_spec = Some(JobSpecSource::Raw(raw.to_string()));

        let job = build_job(&rec, "ns", &ImageDefaults::default()).unwrap();
        let pod = pod(&job);
        assert_eq!(pod.security_context.as_ref().unwrap().run_as_user, Some(1000));

        let c = &pod.containers[0];
        assert_eq!(c.name, "worker");
        assert_eq!(c.image.as_deref(), Some("busybox"));
        assert_eq!(c.security_context.as_ref().unwrap().privileged, Some(true));
        // run secret already referenced: not added twice
        assert_eq!(c.env_from.as_ref().unwrap().len(), 1);
        assert_eq!(mount_names(c), vec!["cache", "default", "tmp"]);

        let volumes = pod.volumes.as_ref().unwrap();
        let names: Vec<_> = volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["cache", "default", "tmp"]);
        let work = volumes.iter().find(|v| v.name == "default").unwrap();
        assert!(work.host_path.is_none());
        assert!(work.empty_dir.is_some());

    }

    #[test]
    fn raw_spec_without_default_container_gets_one_appended() {
        let raw = r#"
template:
  spec:
    containers:
      - name: worker
        image: busybox
"#;
        let mut rec = record(RunKind::Stack);
        rec.job_spec = Some(JobSpecSource::Raw(raw.to_string()));

        let job = build_job(&rec, "ns", &ImageDefaults::default()).unwrap();
        let pod = pod(&job);
        let names: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["worker", DEFAULT_CONTAINER]);
        assert_eq!(pod.containers[0].image.as_deref(), Some("busybox"));
        assert_eq!(
            pod.containers[1].image.as_deref(),
            Some("ghcr.io/pluralsh/harness:0.6.18")
        );

        let meta = job.spec.as_ref().unwrap().template.metadata.as_ref().unwrap();
        assert_eq!(
            meta.annotations.as_ref().unwrap()[DEFAULT_CONTAINER_ANNOTATION],
            DEFAULT_CONTAINER
        );
    }

    #[test]
    fn declared_default_container_is_not_duplicated() {
        let raw = r#"
template:
  spec:
    containers:
      - name: sidecar
        image: proxy
      - name: default
        image: tool:1
"#;
        let mut rec = record(RunKind::Sentinel);
        rec.job_spec = Some(JobSpecSource::Raw(raw.to_string()));

        let job = build_job(&rec, "ns", &ImageDefaults::default()).unwrap();
        let names: Vec<_> = pod(&job).containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["sidecar", DEFAULT_CONTAINER]);
        assert_eq!(pod(&job).containers[1].image.as_deref(), Some("tool:1"));
    }

    #[test]
    fn malformed_raw_spec_falls_back_to_defaults() {
        let mut rec = record(RunKind::Stack);
        rec.job_spec = Some(JobSpecSource::Raw("template: [not, a, pod".to_string()));

        let job = build_job(&rec, "ns", &ImageDefaults::default()).unwrap();
        let pod = pod(&job);
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.containers[0].name, DEFAULT_CONTAINER);
    }

    // =========================================================================
    // Namespaces
    // =========================================================================

    #[test]
    fn sentinel_runs_use_the_declared_template_namespace() {
        let mut rec = record(RunKind::Sentinel);
        assert_eq!(run_namespace(&rec, "runsync"), "runsync");

        rec.job_spec = Some(JobSpecSource::Raw(
            "template:\n  metadata:\n    namespace: scans\n".to_string(),
        ));
        assert_eq!(run_namespace(&rec, "runsync"), "scans");

        rec.job_spec = Some(JobSpecSource::Structured(StructuredJobSpec {
            namespace: Some("audits".to_string()),
            ..Default::default()
        }));
        assert_eq!(run_namespace(&rec, "runsync"), "audits");

        rec.job_spec = Some(JobSpecSource::Structured(StructuredJobSpec {
            namespace: Some(String::new()),
            ..Default::default()
        }));
        assert_eq!(run_namespace(&rec, "runsync"), "runsync");
    }

    #[test]
    fn other_kinds_ignore_declared_namespaces() {
        for kind in [RunKind::Stack, RunKind::Gate] {
            let mut rec = record(kind);
            rec.job_spec = Some(JobSpecSource::Raw(
                "template:\n  metadata:\n    namespace: scans\n".to_string(),
            ));
            assert_eq!(run_namespace(&rec, "runsync"), "runsync");
        }
    }

    // =========================================================================
    // Resources
    // =========================================================================

    #[test]
    fn resources_fill_only_missing_keys() {
        let raw = r#"
template:
  spec:
    containers:
      - name: default
        resources:
          requests:
            cpu: "2"
"#;
        let mut rec = record(RunKind::Stack);
        rec.job_spec = Some(JobSpecSource::Raw(raw.to_string()));
        rec.resources = Some(RunResources {
            requests: Some(ResourceValues {
                cpu: Some("500m".to_string()),
                memory: Some("1Gi".to_string()),
            }),
            limits: Some(ResourceValues {
                cpu: None,
                memory: Some("2Gi".to_string()),
            }),
        });

        let job = build_job(&rec, "ns", &ImageDefaults::default()).unwrap();
        let res = pod(&job).containers[0].resources.as_ref().unwrap();
        let requests = res.requests.as_ref().unwrap();
        assert_eq!(requests["cpu"], Quantity("2".to_string()));
        assert_eq!(requests["memory"], Quantity("1Gi".to_string()));
        let limits = res.limits.as_ref().unwrap();
        assert_eq!(limits["memory"], Quantity("2Gi".to_string()));
        assert!(!limits.contains_key("cpu"));
    }

    #[test]
    fn invalid_quantity_is_a_validation_error() {
        let mut rec = record(RunKind::Stack);
        rec.resources = Some(RunResources {
            requests: Some(ResourceValues {
                cpu: Some("lots".to_string()),
                memory: None,
            }),
            limits: None,
        });

        let err = build_job(&rec, "ns", &ImageDefaults::default()).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("lots"));
    }

    #[test]
    fn quantity_grammar() {
        for ok in ["1", "500m", "1.5", ".5", "2Gi", "128Mi", "1e3", "2E-2", "+1k", "0"] {
            assert!(is_valid_quantity(ok), "{} should be valid", ok);
        }
        for bad in ["", "lots", "1.2.3", "Gi", "1Gb", "1e", ".", "1 Gi"] {
            assert!(!is_valid_quantity(bad), "{} should be invalid", bad);
        }
    }

    // =========================================================================
    // Image resolution
    // =========================================================================

    fn settings(image: Option<&str>, tag: Option<&str>, version: Option<&str>, tool: Option<&str>) -> ImageSettings {
        ImageSettings {
            image: image.map(str::to_string),
            tag: tag.map(str::to_string),
            version: version.map(str::to_string),
            tool: tool.map(str::to_string),
        }
    }

    #[test]
    fn image_resolution_priority() {
        let d = ImageDefaults::default();
        assert_eq!(
            d.resolve(&settings(Some("my/img"), Some("v1"), Some("9"), None)),
            "my/img:v1"
        );
        assert_eq!(
            d.resolve(&settings(None, Some("v1"), None, Some("TERRAFORM"))),
            "ghcr.io/pluralsh/harness:v1"
        );
        assert_eq!(
            d.resolve(&settings(Some("my/img"), None, Some("1.9"), None)),
            "my/img:1.9"
        );
        assert_eq!(d.resolve(&settings(Some("my/img"), None, None, None)), "my/img:0.6.18");
        assert_eq!(
            d.resolve(&settings(None, None, Some("1.9.0"), Some("TERRAFORM"))),
            "ghcr.io/pluralsh/harness:0.6.18-terraform-1.9.0"
        );
        assert_eq!(
            d.resolve(&settings(None, None, None, Some("ANSIBLE"))),
            "ghcr.io/pluralsh/harness:0.6.18-ansible-latest"
        );
        assert_eq!(d.resolve(&settings(None, None, None, None)), "ghcr.io/pluralsh/harness:0.6.18");
        assert_eq!(
            d.resolve(&settings(Some(""), Some(""), None, Some("CUSTOM"))),
            "ghcr.io/pluralsh/harness:0.6.18-custom"
        );
    }
}
