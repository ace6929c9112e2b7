//! Per-run Secret provisioning
//!
//! Every run gets a Secret named like its Job holding the console URL, the
//! deploy token, the run id and, when set, the output format hint. Only these
//! tracked keys are compared, so keys added by other writers never cause a
//! rewrite.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::Resource;
use runsync_common::crd::RUN_ID_LABEL;
use runsync_common::kube_utils::create_or_adopt;
use runsync_common::ResourceClient;
use runsync_console::RunRecord;
use tracing::{debug, info};

use crate::error::JobError;

pub const CONSOLE_URL_KEY: &str = "CONSOLE_URL";
pub const CONSOLE_TOKEN_KEY: &str = "CONSOLE_TOKEN";
pub const RUN_ID_KEY: &str = "RUN_ID";
pub const OUTPUT_FORMAT_KEY: &str = "OUTPUT_FORMAT";

const TRACKED_KEYS: [&str; 4] = [CONSOLE_URL_KEY, CONSOLE_TOKEN_KEY, RUN_ID_KEY, OUTPUT_FORMAT_KEY];

/// Builds and maintains run Secrets
#[derive(Clone)]
pub struct SecretProvisioner {
    console_url: String,
    token: String,
}

impl std::fmt::Debug for SecretProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretProvisioner")
            .field("console_url", &self.console_url)
            .finish_non_exhaustive()
    }
}

impl SecretProvisioner {
    pub fn new(console_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            console_url: console_url.into(),
            token: token.into(),
        }
    }

    /// Tracked key/value pairs for a run
    pub fn desired_data(&self, record: &RunRecord) -> BTreeMap<String, String> {
        let mut data = BTreeMap::from([
            (CONSOLE_URL_KEY.to_string(), self.console_url.clone()),
            (CONSOLE_TOKEN_KEY.to_string(), self.token.clone()),
            (RUN_ID_KEY.to_string(), record.id.clone()),
        ]);
        if let Some(format) = record.output_format.as_ref().filter(|f| !f.is_empty()) {
            data.insert(OUTPUT_FORMAT_KEY.to_string(), format.clone());
        }
        data
    }

    /// The Secret for a run as it should exist
    pub fn build(&self, record: &RunRecord, namespace: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(record.kind.resource_name(&record.id)),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    RUN_ID_LABEL.to_string(),
                    record.id.clone(),
                )])),
                ..Default::default()
            },
            data: Some(encode(self.desired_data(record))),
            ..Default::default()
        }
    }

    /// Create the Secret if absent, else rewrite it when a tracked key differs
    pub async fn ensure(
        &self,
        secrets: &dyn ResourceClient<Secret>,
        record: &RunRecord,
        namespace: &str,
    ) -> Result<Secret, JobError> {
        let desired = self.build(record, namespace);
        let name = record.kind.resource_name(&record.id);

        let Some(mut existing) = secrets.get(&name).await? else {
            info!(secret = %name, "creating run secret");
            return Ok(create_or_adopt(secrets, &desired, &name).await?);
        };

        let wanted = self.desired_data(record);
        if tracked_keys_match(&existing, &wanted) {
            return Ok(existing);
        }

        debug!(secret = %name, "run secret out of date, updating");
        let data = existing.data.get_or_insert_with(BTreeMap::new);
        for key in TRACKED_KEYS {
            match wanted.get(key) {
                Some(value) => {
                    data.insert(key.to_string(), ByteString(value.clone().into_bytes()));
                }
                None => {
                    data.remove(key);
                }
            }
        }
        Ok(secrets.update(&existing).await?)
    }

    /// Make the Job the controlling owner of its Secret so it is collected
    /// with the Job. A previous controller (a Job replaced by a rerun) is
    /// dropped. A Job without a uid yet is skipped.
    pub async fn attach_owner(
        &self,
        secrets: &dyn ResourceClient<Secret>,
        secret: &Secret,
        job: &Job,
    ) -> Result<(), JobError> {
        let Some(owner) = job.controller_owner_ref(&()) else {
            return Ok(());
        };
        let refs = secret.metadata.owner_references.as_deref().unwrap_or_default();
        if refs.iter().any(|r| r.uid == owner.uid) {
            return Ok(());
        }

        let mut secret = secret.clone();
        let refs = secret.metadata.owner_references.get_or_insert_with(Vec::new);
        refs.retain(|r| r.controller != Some(true));
        refs.push(owner);
        secrets.update(&secret).await?;
        Ok(())
    }
}

fn encode(data: BTreeMap<String, String>) -> BTreeMap<String, ByteString> {
    data.into_iter()
        .map(|(k, v)| (k, ByteString(v.into_bytes())))
        .collect()
}

/// Compare only the tracked keys; string data not yet merged by the API
/// server counts too
fn tracked_keys_match(secret: &Secret, wanted: &BTreeMap<String, String>) -> bool {
    let read = |key: &str| -> Option<String> {
        secret
            .string_data
            .as_ref()
            .and_then(|d| d.get(key).cloned())
            .or_else(|| {
                secret
                    .data
                    .as_ref()
                    .and_then(|d| d.get(key))
                    .map(|b| String::from_utf8_lossy(&b.0).into_owned())
            })
    };
    TRACKED_KEYS
        .iter()
        .all(|key| read(key).as_ref() == wanted.get(*key))
}
