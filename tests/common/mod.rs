#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value, json};
use switchyard::{
    FederatedQueryPlanner, FederationGateway, GatewayConfig, HttpDispatcher, HttpSchemaFetcher,
    SchemaComposer, schema_composer::SERVICE_DEFINITION_QUERY,
};
use wiremock::{
    Mock, MockServer, Request, ResponseTemplate,
    matchers::{body_string_contains, method, path},
};

pub const ACCOUNTS_SDL: &str = r#"
    type Query {
        me: User
        users: [User!]!
    }

    type User @key(fields: "id") {
        id: ID!
        name: String
        username: String
    }
"#;

pub const PRODUCTS_SDL: &str = r#"
    type Query {
        topProducts(first: Int = 5): [Product]
    }

    type Mutation {
        createProduct(name: String!): Product
    }

    type Product @key(fields: "upc") {
        upc: String!
        name: String
        price: Int
    }
"#;

pub const REVIEWS_SDL: &str = r#"
    type Review {
        id: ID!
        body: String
        author: User
        product: Product
    }

    extend type User @key(fields: "id") {
        id: ID! @external
        reviews: [Review]
    }

    extend type Product @key(fields: "upc") {
        upc: String! @external
        reviews: [Review]
    }
"#;

pub const MEDIA_SDL: &str = r#"
    scalar Upload

    type Query {
        uploads: [String]
    }

    type Mutation {
        upload(file: Upload!): String
    }
"#;

/// Three mocked subgraphs serving their SDL through `_service`.
pub struct TestFixture {
    pub accounts: MockServer,
    pub products: MockServer,
    pub reviews: MockServer,
}

impl TestFixture {
    pub async fn setup() -> Self {
        let fixture = TestFixture {
            accounts: MockServer::start().await,
            products: MockServer::start().await,
            reviews: MockServer::start().await,
        };

        serve_sdl(&fixture.accounts, ACCOUNTS_SDL).await;
        serve_sdl(&fixture.products, PRODUCTS_SDL).await;
        serve_sdl(&fixture.reviews, REVIEWS_SDL).await;

        fixture
    }

    /// Gateway configuration for the three subgraphs, plus extra top-level YAML.
    pub fn config(&self, extra: &str) -> GatewayConfig {
        let yaml = format!(
            "subgraphs:\n  - name: accounts\n    url: {}/graphql\n  \
             - name: products\n    url: {}/graphql\n  \
             - name: reviews\n    url: {}/graphql\n{extra}",
            self.accounts.uri(),
            self.products.uri(),
            self.reviews.uri(),
        );
        GatewayConfig::from_yaml(&yaml).unwrap()
    }

    pub async fn gateway(
        &self,
        config: &GatewayConfig,
    ) -> (Arc<FederationGateway>, Arc<SchemaComposer>) {
        build_gateway(config).await
    }
}

pub async fn build_gateway(
    config: &GatewayConfig,
) -> (Arc<FederationGateway>, Arc<SchemaComposer>) {
    let fetcher = Arc::new(HttpSchemaFetcher::new(config.subgraph_timeout()));
    let composer = Arc::new(SchemaComposer::new(config.registry().unwrap(), fetcher));
    composer.bootstrap(&config.startup).await.unwrap();

    let dispatcher =
        HttpDispatcher::new(config.header_policy().unwrap(), config.subgraph_timeout());
    let gateway = FederationGateway::new(
        composer.subscribe(),
        Box::new(FederatedQueryPlanner::new()),
        Box::new(dispatcher),
    );

    (Arc::new(gateway), composer)
}

pub async fn serve_sdl(server: &MockServer, sdl: &str) {
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("__ApolloGetServiceDefinition__"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": { "_service": { "sdl": sdl } } })),
        )
        .mount(server)
        .await;
}

/// Answers operations whose body contains `fragment`.
pub async fn respond(server: &MockServer, fragment: &str, template: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains(fragment))
        .respond_with(template)
        .mount(server)
        .await;
}

pub fn data(body: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(body)
}

/// Requests a mock received, excluding schema fetches.
pub async fn operation_requests(server: &MockServer) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|request| {
            !String::from_utf8_lossy(&request.body).contains(SERVICE_DEFINITION_QUERY)
        })
        .collect()
}
