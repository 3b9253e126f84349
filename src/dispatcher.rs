use std::{collections::BTreeSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use http::HeaderMap;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::{
    error::{ExecutionError, FetchError, UploadError},
    header_policy::HeaderPolicy,
    query_planner::{EntityTarget, ExecutionPlan, PlanStep, StepId},
    response::{
        GraphQLError, MergedResponse, PathElement, collect_objects, deep_merge, project,
        value_at_mut,
    },
    supergraph::KeySelection,
    upload::{Upload, forward_form},
};

/// Everything a request carries besides the operation itself.
#[derive(Debug, Default)]
pub struct RequestContext {
    /// Inbound client headers, filtered by the header policy per subgraph call.
    pub headers: HeaderMap,
    pub variables: Map<String, Value>,
    pub uploads: Vec<Arc<Upload>>,
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        plan: &ExecutionPlan,
        context: &RequestContext,
    ) -> Result<MergedResponse, ExecutionError>;
}

/// Runs plan steps against subgraphs over HTTP, as early as their
/// dependencies allow.
pub struct HttpDispatcher {
    client: reqwest::Client,
    policy: HeaderPolicy,
    timeout: Duration,
}

impl HttpDispatcher {
    pub fn new(policy: HeaderPolicy, timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), policy, timeout)
    }

    pub fn with_client(client: reqwest::Client, policy: HeaderPolicy, timeout: Duration) -> Self {
        HttpDispatcher {
            client,
            policy,
            timeout,
        }
    }

    async fn run_step<'p>(
        &self,
        step: &'p PlanStep,
        representations: Option<Vec<Value>>,
        context: &RequestContext,
    ) -> (&'p PlanStep, Result<SubgraphResponse, StepFailure>) {
        tracing::debug!(step = step.id, subgraph = step.subgraph.name(), "dispatching step");

        let request = self.send(step, representations, context);
        let result = match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(StepFailure::Fetch(FetchError::Timeout)),
        };

        if let Err(failure) = &result {
            tracing::warn!(
                step = step.id,
                subgraph = step.subgraph.name(),
                error = %failure,
                "subgraph request failed"
            );
        }

        (step, result)
    }

    async fn send(
        &self,
        step: &PlanStep,
        representations: Option<Vec<Value>>,
        context: &RequestContext,
    ) -> Result<SubgraphResponse, StepFailure> {
        let mut variables: Map<String, Value> = step
            .variables
            .iter()
            .filter_map(|name| {
                let value = context.variables.get(name)?;
                Some((name.clone(), value.clone()))
            })
            .collect();
        if let Some(representations) = representations {
            variables.insert("representations".to_string(), Value::Array(representations));
        }

        let mut headers = HeaderMap::new();
        self.policy.apply(&context.headers, &mut headers);

        let request = self.client.post(step.subgraph.endpoint().clone()).headers(headers);
        let has_uploads = context
            .uploads
            .iter()
            .any(|upload| upload.is_used_by(&step.variables));
        let request = if has_uploads {
            let form = forward_form(&step.query, &variables, &context.uploads, &step.variables)?;
            request.multipart(form)
        } else {
            request.json(&json!({ "query": step.query, "variables": variables }))
        };

        let response = request.send().await.map_err(FetchError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()).into());
        }

        let body = response.bytes().await.map_err(FetchError::from)?;
        let response: SubgraphResponse =
            serde_json::from_slice(&body).map_err(|e| FetchError::Malformed(e.to_string()))?;

        if response.data.is_none() && response.errors.is_empty() {
            let reason = "response has neither data nor errors".to_string();
            return Err(FetchError::Malformed(reason).into());
        }

        Ok(response)
    }
}

#[async_trait]
impl QueryExecutor for HttpDispatcher {
    async fn execute(
        &self,
        plan: &ExecutionPlan,
        context: &RequestContext,
    ) -> Result<MergedResponse, ExecutionError> {
        let mut data = json!({ "__typename": plan.root_type });
        for key in &plan.typename_keys {
            data[key.as_str()] = Value::String(plan.root_type.clone());
        }
        let mut errors = Vec::new();

        let mut started = vec![false; plan.steps.len()];
        let mut finished: BTreeSet<StepId> = BTreeSet::new();
        let mut failed: BTreeSet<StepId> = BTreeSet::new();
        let mut targets: Vec<Vec<Vec<PathElement>>> = vec![Vec::new(); plan.steps.len()];
        let mut executed = 0usize;
        let mut succeeded = 0usize;
        let mut running = FuturesUnordered::new();

        loop {
            // Skipped steps finish immediately, which can unblock later steps.
            let mut launched = true;
            while launched {
                launched = false;

                for step in &plan.steps {
                    if started[step.id] || !step.depends_on.is_subset(&finished) {
                        continue;
                    }
                    started[step.id] = true;
                    launched = true;

                    if !step.depends_on.is_disjoint(&failed) {
                        tracing::debug!(step = step.id, "dependency failed, skipping step");
                        if step.is_root() {
                            for key in &step.response_keys {
                                errors.push(
                                    GraphQLError::new("not executed because an earlier step failed")
                                        .with_path(vec![PathElement::Key(key.clone())])
                                        .with_extension("service", step.subgraph.name()),
                                );
                            }
                        }
                        failed.insert(step.id);
                        finished.insert(step.id);
                        continue;
                    }

                    let representations = match &step.entity {
                        None => None,
                        Some(entity) => {
                            let (paths, found) = gather_representations(&data, step, entity);
                            if found.is_empty() {
                                tracing::debug!(step = step.id, "no entities to resolve, skipping");
                                finished.insert(step.id);
                                continue;
                            }
                            targets[step.id] = paths;
                            Some(found)
                        }
                    };

                    executed += 1;
                    running.push(self.run_step(step, representations, context));
                }
            }

            let Some((step, result)) = running.next().await else {
                break;
            };
            finished.insert(step.id);

            let service = step.subgraph.name();
            let step_targets = &targets[step.id];

            let result = result.and_then(|response| {
                for error in response.errors {
                    errors.push(reroot_error(error, step, step_targets));
                }

                match (&step.entity, response.data) {
                    (None, Some(Value::Object(object))) => {
                        deep_merge(&mut data, Value::Object(object));
                        Ok(true)
                    }
                    (Some(_), Some(Value::Object(mut object))) => match object.remove("_entities") {
                        Some(Value::Array(entities)) => {
                            for (path, entity) in step_targets.iter().zip(entities) {
                                if let Some(slot) = value_at_mut(&mut data, path) {
                                    deep_merge(slot, entity);
                                }
                            }
                            Ok(true)
                        }
                        _ => Err(StepFailure::Fetch(FetchError::Malformed(
                            "`_entities` is missing from the response".to_string(),
                        ))),
                    },
                    _ => Ok(false),
                }
            });

            match result {
                Ok(true) => succeeded += 1,
                Ok(false) => {
                    failed.insert(step.id);
                }
                Err(failure) => {
                    failed.insert(step.id);
                    let code = failure.code();
                    let message = format!("request to subgraph `{service}` failed: {failure}");

                    for path in failure_paths(step, step_targets) {
                        errors.push(
                            GraphQLError::new(message.clone())
                                .with_path(path)
                                .with_extension("code", code)
                                .with_extension("service", service),
                        );
                    }
                }
            }
        }

        if executed > 0 && succeeded == 0 {
            return Err(ExecutionError::AllStepsFailed { errors });
        }

        Ok(MergedResponse {
            data: project(&data, &plan.shape),
            errors,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SubgraphResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQLError>,
}

#[derive(Debug, thiserror::Error)]
enum StepFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl StepFailure {
    fn code(&self) -> &'static str {
        match self {
            StepFailure::Fetch(FetchError::Timeout) => "SUBREQUEST_TIMEOUT",
            StepFailure::Fetch(FetchError::Malformed(_)) => "SUBREQUEST_MALFORMED_RESPONSE",
            StepFailure::Fetch(_) => "SUBREQUEST_HTTP_ERROR",
            StepFailure::Upload(_) => "UPLOAD_FORWARDING_FAILED",
        }
    }
}

/// Representations for an entity step, with the response paths they came from.
fn gather_representations(
    data: &Value,
    step: &PlanStep,
    entity: &EntityTarget,
) -> (Vec<Vec<PathElement>>, Vec<Value>) {
    collect_objects(data, &step.path)
        .into_iter()
        .filter(|(_, object)| {
            object.get("__typename").and_then(Value::as_str) == Some(entity.type_name.as_str())
        })
        .filter_map(|(path, object)| {
            representation(&entity.type_name, &entity.key, object).map(|found| (path, found))
        })
        .unzip()
}

/// Builds the `_Any` representation of `object`, or `None` when a key field
/// is missing.
fn representation(
    type_name: &str,
    key: &KeySelection,
    object: &Map<String, Value>,
) -> Option<Value> {
    let mut representation = select_key(key, object)?;
    representation.insert("__typename".to_string(), Value::String(type_name.to_string()));
    Some(Value::Object(representation))
}

fn select_key(key: &KeySelection, object: &Map<String, Value>) -> Option<Map<String, Value>> {
    key.0
        .iter()
        .map(|field| {
            let value = object.get(&field.name).filter(|value| !value.is_null())?;
            let value = if field.selection.0.is_empty() {
                value.clone()
            } else {
                Value::Object(select_key(&field.selection, value.as_object()?)?)
            };
            Some((field.name.clone(), value))
        })
        .collect()
}

/// Client paths affected when a step produced nothing.
fn failure_paths(step: &PlanStep, targets: &[Vec<PathElement>]) -> Vec<Vec<PathElement>> {
    let keys = step.response_keys.iter().map(|key| PathElement::Key(key.clone()));

    if step.is_root() {
        return keys.map(|key| vec![key]).collect();
    }

    targets
        .iter()
        .flat_map(|target| {
            keys.clone().map(move |key| {
                let mut path = target.clone();
                path.push(key);
                path
            })
        })
        .collect()
}

/// Rewrites an `_entities` error path onto the client response and tags the
/// error with the subgraph it came from.
fn reroot_error(
    mut error: GraphQLError,
    step: &PlanStep,
    targets: &[Vec<PathElement>],
) -> GraphQLError {
    if step.entity.is_some() {
        error.path = match error.path.as_deref() {
            Some([PathElement::Key(root), PathElement::Index(index), rest @ ..])
                if root == "_entities" =>
            {
                targets.get(*index).map(|target| {
                    let mut path = target.clone();
                    path.extend_from_slice(rest);
                    path
                })
            }
            _ => None,
        };
    }

    let extensions = error.extensions.get_or_insert_with(Map::new);
    extensions
        .entry("service")
        .or_insert_with(|| Value::String(step.subgraph.name().to_string()));
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        query_planner::{FederatedQueryPlanner, PathSegment, QueryPlanner},
        subgraph_registry::SubgraphDescriptor,
        supergraph::tests::schema,
    };
    use pretty_assertions::assert_eq;
    use url::Url;

    fn entity_step() -> PlanStep {
        PlanStep {
            id: 1,
            subgraph: Arc::new(SubgraphDescriptor::new(
                "reviews",
                Url::parse("http://reviews.local/graphql").unwrap(),
            )),
            query: String::new(),
            depends_on: BTreeSet::from([0]),
            path: vec![PathSegment::Field("users".to_string()), PathSegment::Flatten],
            entity: Some(EntityTarget {
                type_name: "User".to_string(),
                key: KeySelection::parse("id").unwrap(),
            }),
            variables: BTreeSet::new(),
            response_keys: vec!["reviews".to_string()],
        }
    }

    fn users_path(index: usize) -> Vec<PathElement> {
        vec![PathElement::Key("users".to_string()), PathElement::Index(index)]
    }

    #[test]
    fn builds_representations_from_key_fields() {
        let key = KeySelection::parse("sku owner { id }").unwrap();
        let object = json!({ "sku": "a1", "name": "Chair", "owner": { "id": "7", "name": "x" } });

        assert_eq!(
            representation("Product", &key, object.as_object().unwrap()),
            Some(json!({ "sku": "a1", "owner": { "id": "7" }, "__typename": "Product" }))
        );

        let missing = json!({ "sku": "a1", "owner": null });
        assert_eq!(representation("Product", &key, missing.as_object().unwrap()), None);
    }

    #[test]
    fn reroots_entity_errors() {
        let step = entity_step();
        let targets = vec![users_path(0), users_path(2)];
        let error = GraphQLError::new("nope").with_path(vec![
            PathElement::Key("_entities".to_string()),
            PathElement::Index(1),
            PathElement::Key("reviews".to_string()),
        ]);

        let error = reroot_error(error, &step, &targets);

        let mut expected = users_path(2);
        expected.push(PathElement::Key("reviews".to_string()));
        assert_eq!(error.path, Some(expected));
        assert_eq!(error.extensions.unwrap()["service"], "reviews");
    }

    #[test]
    fn failed_entity_steps_report_every_affected_path() {
        let step = entity_step();
        let paths = failure_paths(&step, &[users_path(0), users_path(1)]);

        assert_eq!(paths.len(), 2);
        assert_eq!(paths[1].last(), Some(&PathElement::Key("reviews".to_string())));
    }

    #[test]
    fn failure_codes_follow_the_cause() {
        assert_eq!(StepFailure::Fetch(FetchError::Timeout).code(), "SUBREQUEST_TIMEOUT");
        assert_eq!(StepFailure::Fetch(FetchError::Status(500)).code(), "SUBREQUEST_HTTP_ERROR");
        assert_eq!(
            StepFailure::Fetch(FetchError::Malformed(String::new())).code(),
            "SUBREQUEST_MALFORMED_RESPONSE"
        );
    }

    #[tokio::test]
    async fn aliased_root_typename_is_answered_locally() {
        let plan = FederatedQueryPlanner::new()
            .plan("{ t: __typename __typename }", None, &schema())
            .unwrap();
        let dispatcher = HttpDispatcher::new(
            HeaderPolicy::allow_list(Vec::<String>::new()).unwrap(),
            Duration::from_secs(1),
        );

        let response = dispatcher.execute(&plan, &RequestContext::default()).await.unwrap();

        assert_eq!(response.data, json!({ "t": "Query", "__typename": "Query" }));
        assert!(response.errors.is_empty());
    }
}
