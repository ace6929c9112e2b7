//! RunJob CRD installation

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use runsync_common::crd::RunJob;
use runsync_common::{retry_with_backoff, Error, RetryConfig};

const CRD_NAME: &str = "runjobs.runsync.plural.sh";
const FIELD_MANAGER: &str = "runsync-controller";

/// The RunJob CRD as YAML
pub fn crd_yaml() -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&RunJob::crd())
}

/// Install or update the RunJob CRD with server-side apply
pub async fn ensure_crds_installed(client: &Client) -> Result<(), Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = RunJob::crd();

    tracing::info!(crd = CRD_NAME, "installing CRD");
    retry_with_backoff(&RetryConfig::with_max_attempts(10), "install_crd", || {
        let crds = crds.clone();
        let params = params.clone();
        let crd = crd.clone();
        async move {
            crds.patch(CRD_NAME, &params, &Patch::Apply(&crd))
                .await
                .map_err(|e| Error::from_kube(e, "CustomResourceDefinition", CRD_NAME))?;
            Ok(())
        }
    })
    .await?;
    tracing::info!(crd = CRD_NAME, "CRD installed/updated");
    Ok(())
}
