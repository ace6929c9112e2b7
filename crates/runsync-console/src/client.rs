//! GraphQL client for the console API

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::ConsoleError;
use crate::model::{
    ContainerSpec, ImageSettings, JobSpecSource, Page, PageInfo, RunKind, RunRecord,
    RunResources, RunState, RunStep, StatusAttributes, StepStatus, StructuredJobSpec,
};
use crate::source::RunSource;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const RUN_FIELDS: &str = "id status startedAt outputFormat type \
    configuration { image tag version } \
    jobSpec { raw namespace labels annotations serviceAccount \
      containers { image args env { name value } envFrom { secret } } \
      requests { requests { cpu memory } limits { cpu memory } } }";

/// Only stack runs have steps
const STEP_FIELDS: &str = "steps { id status }";

const UPDATE_STEP_MUTATION: &str = "mutation UpdateStep($id: ID!, $attributes: RunStepAttributes!) \
    { updateRunStep(id: $id, attributes: $attributes) { id } }";

/// GraphQL field names for one run kind
struct Operations {
    get: &'static str,
    list: &'static str,
    update: &'static str,
    attributes: &'static str,
    extra_fields: &'static str,
}

fn operations(kind: RunKind) -> Operations {
    match kind {
        RunKind::Gate => Operations {
            get: "clusterGate",
            list: "clusterGates",
            update: "updateGate",
            attributes: "GateUpdateAttributes",
            extra_fields: "",
        },
        RunKind::Stack => Operations {
            get: "stackRun",
            list: "clusterStackRuns",
            update: "updateStackRun",
            attributes: "StackRunAttributes",
            extra_fields: STEP_FIELDS,
        },
        RunKind::Sentinel => Operations {
            get: "sentinelRun",
            list: "clusterSentinelRuns",
            update: "updateSentinelRun",
            attributes: "SentinelRunAttributes",
            extra_fields: "",
        },
    }
}

fn get_query(kind: RunKind) -> String {
    let ops = operations(kind);
    format!(
        "query Run($id: ID!) {{ run: {}(id: $id) {{ {} {} }} }}",
        ops.get, RUN_FIELDS, ops.extra_fields
    )
}

fn list_query(kind: RunKind) -> String {
    let ops = operations(kind);
    format!(
        "query Runs($after: String, $first: Int) {{ runs: {}(after: $after, first: $first) \
         {{ pageInfo {{ hasNextPage endCursor }} edges {{ node {{ {} {} }} }} }} }}",
        ops.list, RUN_FIELDS, ops.extra_fields
    )
}

fn update_mutation(kind: RunKind) -> String {
    let ops = operations(kind);
    format!(
        "mutation Update($id: ID!, $attributes: {}!) {{ update: {}(id: $id, attributes: $attributes) {{ id }} }}",
        ops.attributes, ops.update
    )
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GetData {
    run: Option<RunNode>,
}

#[derive(Debug, Deserialize)]
struct ListData {
    runs: Option<Connection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection {
    page_info: PageInfo,
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Debug, Deserialize)]
struct Edge {
    node: Option<RunNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunNode {
    id: String,
    status: RunState,
    started_at: Option<DateTime<Utc>>,
    output_format: Option<String>,
    #[serde(rename = "type")]
    tool: Option<String>,
    configuration: Option<ImageSettings>,
    job_spec: Option<JobSpecNode>,
    #[serde(default)]
    steps: Option<Vec<Option<RunStep>>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobSpecNode {
    raw: Option<String>,
    namespace: Option<String>,
    #[serde(default)]
    labels: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default)]
    annotations: Option<std::collections::BTreeMap<String, String>>,
    service_account: Option<String>,
    #[serde(default)]
    containers: Option<Vec<ContainerNode>>,
    requests: Option<RunResources>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerNode {
    image: Option<String>,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    env: Option<Vec<EnvNode>>,
    #[serde(default)]
    env_from: Option<Vec<EnvFromNode>>,
}

#[derive(Debug, Deserialize)]
struct EnvNode {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct EnvFromNode {
    secret: String,
}

#[derive(Serialize)]
struct Request<'a> {
    query: &'a str,
    variables: serde_json::Value,
}

impl RunNode {
    fn into_record(self, kind: RunKind) -> RunRecord {
        let mut image = self.configuration.unwrap_or_default();
        if image.tool.is_none() {
            image.tool = self.tool;
        }
        let (job_spec, resources) = match self.job_spec {
            Some(spec) => {
                let resources = spec.requests.clone();
                (spec.into_source(), resources)
            }
            None => (None, None),
        };

        RunRecord {
            id: self.id,
            kind,
            status: self.status,
            job_spec,
            resources,
            output_format: self.output_format,
            start_time: self.started_at,
            image,
            steps: self.steps.unwrap_or_default().into_iter().flatten().collect(),
        }
    }
}

impl JobSpecNode {
    fn into_source(self) -> Option<JobSpecSource> {
        if let Some(raw) = self.raw.filter(|r| !r.trim().is_empty() && r.trim() != "null") {
            return Some(JobSpecSource::Raw(raw));
        }

        let containers: Vec<ContainerSpec> = self
            .containers
            .unwrap_or_default()
            .into_iter()
            .map(|c| ContainerSpec {
                image: c.image.filter(|i| !i.is_empty()),
                args: c.args.unwrap_or_default(),
                env: c
                    .env
                    .unwrap_or_default()
                    .into_iter()
                    .map(|e| (e.name, e.value))
                    .collect(),
                env_from: c
                    .env_from
                    .unwrap_or_default()
                    .into_iter()
                    .map(|e| e.secret)
                    .collect(),
            })
            .collect();

        let structured = StructuredJobSpec {
            namespace: self.namespace.filter(|n| !n.is_empty()),
            labels: self.labels.unwrap_or_default(),
            annotations: self.annotations.unwrap_or_default(),
            service_account: self.service_account,
            containers,
        };
        if structured == StructuredJobSpec::default() {
            return None;
        }
        Some(JobSpecSource::Structured(structured))
    }
}

fn is_not_found_message(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("not found") || lower.contains("could not find")
}

// =============================================================================
// Client
// =============================================================================

/// Console API client authenticated with a deploy token
#[derive(Clone)]
pub struct ConsoleClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl ConsoleClient {
    /// Build a client for the console at `url`
    pub fn new(url: &str, token: impl Into<String>) -> Result<Self, ConsoleError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/gql", url.trim_end_matches('/')),
            token: token.into(),
        })
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<Option<T>, ConsoleError> {
        let resp: GraphQlResponse<T> = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.token))
            .json(&Request { query, variables })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !resp.errors.is_empty() {
            let msg = resp
                .errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ConsoleError::GraphQl(msg));
        }
        Ok(resp.data)
    }
}

/// Rewrite "not found" GraphQL errors into [`ConsoleError::NotFound`]
fn classify(id: &str, err: ConsoleError) -> ConsoleError {
    match err {
        ConsoleError::GraphQl(msg) if is_not_found_message(&msg) => {
            ConsoleError::NotFound { id: id.to_string() }
        }
        other => other,
    }
}

#[async_trait]
impl RunSource for ConsoleClient {
    async fn get_run(&self, kind: RunKind, id: &str) -> Result<RunRecord, ConsoleError> {
        let data: Option<GetData> = self
            .execute(&get_query(kind), json!({ "id": id }))
            .await
            .map_err(|e| classify(id, e))?;

        match data.and_then(|d| d.run) {
            Some(node) => Ok(node.into_record(kind)),
            None => Err(ConsoleError::NotFound { id: id.to_string() }),
        }
    }

    async fn list_runs(
        &self,
        kind: RunKind,
        cursor: Option<String>,
        page_size: usize,
    ) -> Result<Page, ConsoleError> {
        let data: Option<ListData> = self
            .execute(
                &list_query(kind),
                json!({ "after": cursor, "first": page_size }),
            )
            .await?;

        let conn = data
            .and_then(|d| d.runs)
            .ok_or_else(|| ConsoleError::Decode(format!("{} listing returned no data", kind)))?;
        debug!(kind = %kind, count = conn.edges.len(), "listed runs");

        Ok(Page {
            items: conn
                .edges
                .into_iter()
                .filter_map(|e| e.node)
                .map(|n| n.into_record(kind))
                .collect(),
            page_info: conn.page_info,
        })
    }

    async fn update_run_status(
        &self,
        kind: RunKind,
        id: &str,
        attrs: StatusAttributes,
    ) -> Result<(), ConsoleError> {
        let _: Option<serde_json::Value> = self
            .execute(
                &update_mutation(kind),
                json!({ "id": id, "attributes": attrs }),
            )
            .await
            .map_err(|e| classify(id, e))?;
        Ok(())
    }

    async fn update_run_step(&self, step_id: &str, status: StepStatus) -> Result<(), ConsoleError> {
        let _: Option<serde_json::Value> = self
            .execute(
                UPDATE_STEP_MUTATION,
                json!({ "id": step_id, "attributes": { "status": status } }),
            )
            .await
            .map_err(|e| classify(step_id, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(json: serde_json::Value) -> RunNode {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn queries_alias_kind_specific_fields() {
        assert!(get_query(RunKind::Stack).contains("run: stackRun(id: $id)"));
        assert!(list_query(RunKind::Gate).contains("runs: clusterGates(after: $after"));
        assert!(update_mutation(RunKind::Sentinel).contains("$attributes: SentinelRunAttributes!"));
    }

    #[test]
    fn only_stack_queries_select_steps() {
        assert!(get_query(RunKind::Stack).contains("steps { id status }"));
        assert!(list_query(RunKind::Stack).contains("steps { id status }"));
        assert!(!get_query(RunKind::Gate).contains("steps"));
        assert!(!list_query(RunKind::Sentinel).contains("steps"));
        assert!(UPDATE_STEP_MUTATION.contains("RunStepAttributes!"));
    }

    #[test]
    fn stack_steps_are_carried() {
        let record = node(json!({
            "id": "1",
            "status": "RUNNING",
            "steps": [
                { "id": "s1", "status": "SUCCESSFUL" },
                null,
                { "id": "s2", "status": "PENDING" }
            ]
        }))
        .into_record(RunKind::Stack);

        let ids: Vec<_> = record.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        assert_eq!(record.steps[1].status, StepStatus::Pending);
    }

    #[test]
    fn structured_namespace_is_carried() {
        let record = node(json!({
            "id": "1",
            "status": "PENDING",
            "jobSpec": { "namespace": "scans", "containers": [{ "image": "x" }] }
        }))
        .into_record(RunKind::Sentinel);
        match record.job_spec {
            Some(JobSpecSource::Structured(spec)) => {
                assert_eq!(spec.namespace.as_deref(), Some("scans"))
            }
            other => panic!("expected structured spec, got {:?}", other),
        }
    }

    #[test]
    fn raw_job_spec_wins_over_structured_fields() {
        let record = node(json!({
            "id": "1",
            "status": "PENDING",
            "jobSpec": { "raw": "template: {}", "containers": [{ "image": "x" }] }
        }))
        .into_record(RunKind::Stack);
        assert_eq!(record.job_spec, Some(JobSpecSource::Raw("template: {}".to_string())));
    }

    #[test]
    fn null_raw_falls_back_to_structured() {
        let record = node(json!({
            "id": "1",
            "status": "RUNNING",
            "jobSpec": {
                "raw": "null",
                "serviceAccount": "runner",
                "containers": [{
                    "image": "busybox",
                    "env": [{ "name": "A", "value": "1" }],
                    "envFrom": [{ "secret": "creds" }]
                }]
            }
        }))
        .into_record(RunKind::Gate);

        match record.job_spec {
            Some(JobSpecSource::Structured(spec)) => {
                assert_eq!(spec.service_account.as_deref(), Some("runner"));
                assert_eq!(spec.containers[0].image.as_deref(), Some("busybox"));
                assert_eq!(spec.containers[0].env.get("A").map(String::as_str), Some("1"));
                assert_eq!(spec.containers[0].env_from, vec!["creds".to_string()]);
            }
            other => panic!("expected structured spec, got {:?}", other),
        }
    }

    #[test]
    fn empty_job_spec_is_absent() {
        let record = node(json!({ "id": "1", "status": "PENDING", "jobSpec": {} }))
            .into_record(RunKind::Stack);
        assert!(record.job_spec.is_none());
    }

    #[test]
    fn tool_type_and_requests_are_carried() {
        let record = node(json!({
            "id": "9",
            "status": "PENDING",
            "type": "TERRAFORM",
            "startedAt": "2024-05-01T10:00:00Z",
            "configuration": { "version": "1.7.0" },
            "jobSpec": { "requests": { "requests": { "cpu": "500m" } } }
        }))
        .into_record(RunKind::Stack);

        assert_eq!(record.image.tool.as_deref(), Some("TERRAFORM"));
        assert_eq!(record.image.version.as_deref(), Some("1.7.0"));
        assert!(record.start_time.is_some());
        let cpu = record.resources.and_then(|r| r.requests).and_then(|r| r.cpu);
        assert_eq!(cpu.as_deref(), Some("500m"));
    }

    #[test]
    fn not_found_messages_are_classified() {
        let err = classify("7", ConsoleError::GraphQl("could not find resource".to_string()));
        assert!(err.is_not_found());
        let err = classify("7", ConsoleError::GraphQl("forbidden".to_string()));
        assert!(!err.is_not_found());
    }

    #[test]
    fn client_endpoint_trims_trailing_slash() {
        let client = ConsoleClient::new("https://console.example.com/", "tok").unwrap();
        assert_eq!(client.endpoint, "https://console.example.com/gql");
    }
}
