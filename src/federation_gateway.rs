use std::sync::Arc;

use http::HeaderMap;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    dispatcher::{QueryExecutor, RequestContext},
    error::GatewayError,
    operation::OperationKind,
    query_planner::QueryPlanner,
    response::MergedResponse,
    schema_composer::SchemaReceiver,
    supergraph::ComposedSchema,
    upload::Upload,
};

/// A client request as sent in a JSON body or the `operations` multipart part.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Map<String, Value>>,
    #[serde(default)]
    pub operation_name: Option<String>,
}

/// Everything the HTTP layer hands over besides the request body.
#[derive(Debug, Default)]
pub struct RequestExtras {
    pub headers: HeaderMap,
    pub uploads: Vec<Arc<Upload>>,
    /// Set for `GET` requests, which must not trigger side effects.
    pub read_only: bool,
}

pub struct FederationGateway {
    schema: SchemaReceiver,
    query_planner: Box<dyn QueryPlanner>,
    query_executor: Box<dyn QueryExecutor>,
}

impl FederationGateway {
    pub fn new(
        schema: SchemaReceiver,
        query_planner: Box<dyn QueryPlanner>,
        query_executor: Box<dyn QueryExecutor>,
    ) -> Self {
        FederationGateway {
            schema,
            query_planner,
            query_executor,
        }
    }

    /// The schema snapshot new requests are planned against.
    pub fn schema(&self) -> Option<Arc<ComposedSchema>> {
        self.schema.borrow().clone()
    }

    pub async fn process_request(
        &self,
        request: GraphQLRequest,
        extras: RequestExtras,
    ) -> Result<MergedResponse, GatewayError> {
        // Pinned for the whole request; a concurrent refresh only affects later requests.
        let schema = self.schema().ok_or(GatewayError::SchemaUnavailable)?;

        let plan = self
            .query_planner
            .plan(&request.query, request.operation_name.as_deref(), &schema)?;

        if extras.read_only && plan.kind == OperationKind::Mutation {
            return Err(GatewayError::MutationNotAllowed);
        }

        let context = RequestContext {
            headers: extras.headers,
            variables: request.variables.unwrap_or_default(),
            uploads: extras.uploads,
        };

        Ok(self.query_executor.execute(&plan, &context).await?)
    }
}
