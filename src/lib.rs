pub mod config;
pub mod dispatcher;
pub mod error;
pub mod federation_gateway;
pub mod header_policy;
pub mod operation;
pub mod query_planner;
pub mod response;
pub mod schema_composer;
pub mod server;
pub mod subgraph_registry;
pub mod supergraph;
pub mod upload;

pub use config::GatewayConfig;
pub use dispatcher::{HttpDispatcher, QueryExecutor, RequestContext};
pub use federation_gateway::{FederationGateway, GraphQLRequest, RequestExtras};
pub use header_policy::{HeaderDecision, HeaderPolicy};
pub use query_planner::{ExecutionPlan, FederatedQueryPlanner, PlanStep, QueryPlanner};
pub use response::{GraphQLError, MergedResponse};
pub use schema_composer::{HttpSchemaFetcher, SchemaComposer, SchemaFetcher};
pub use subgraph_registry::{SubgraphDescriptor, SubgraphRegistry};
pub use supergraph::ComposedSchema;
