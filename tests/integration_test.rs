mod common;

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use common::{ACCOUNTS_SDL, TestFixture, data, operation_requests, respond, serve_sdl};
use http::{HeaderMap, HeaderValue};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use switchyard::{
    FederationGateway, GraphQLRequest, MergedResponse, RequestExtras,
    error::{CompositionError, ExecutionError, FetchError, GatewayError},
};
use wiremock::{
    Mock, MockServer, Request, ResponseTemplate,
    matchers::{any, body_string_contains},
};

async fn execute_query(
    gateway: &FederationGateway,
    query: &str,
) -> Result<MergedResponse, GatewayError> {
    execute_with_headers(gateway, query, HeaderMap::new()).await
}

async fn execute_with_headers(
    gateway: &FederationGateway,
    query: &str,
    headers: HeaderMap,
) -> Result<MergedResponse, GatewayError> {
    let request = GraphQLRequest {
        query: query.to_string(),
        ..Default::default()
    };
    let extras = RequestExtras {
        headers,
        ..Default::default()
    };
    gateway.process_request(request, extras).await
}

fn client_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", HeaderValue::from_static("Bearer token"));
    headers.insert("cookie", HeaderValue::from_static("session=1"));
    headers.insert("x-tenant", HeaderValue::from_static("acme"));
    headers
}

#[tokio::test]
async fn single_subgraph_query_touches_one_subgraph() {
    let fixture = TestFixture::setup().await;
    let users = json!({
        "data": { "users": [{ "id": "1", "name": "Ada" }, { "id": "2", "name": "Alan" }] }
    });
    respond(&fixture.accounts, "users", data(users)).await;
    let (gateway, _composer) = fixture.gateway(&fixture.config("")).await;

    let response = execute_query(&gateway, "{ users { id name } }").await.unwrap();

    assert_eq!(
        response.data,
        json!({ "users": [{ "id": "1", "name": "Ada" }, { "id": "2", "name": "Alan" }] })
    );
    assert!(response.errors.is_empty());
    assert_eq!(operation_requests(&fixture.accounts).await.len(), 1);
    assert!(operation_requests(&fixture.products).await.is_empty());
    assert!(operation_requests(&fixture.reviews).await.is_empty());
}

#[tokio::test]
async fn entity_fields_are_fetched_after_their_parent() {
    let fixture = TestFixture::setup().await;
    respond(
        &fixture.accounts,
        "me",
        data(json!({ "data": { "me": { "name": "Ada", "id": "1", "__typename": "User" } } })),
    )
    .await;
    respond(
        &fixture.reviews,
        "_entities",
        data(json!({ "data": { "_entities": [{ "reviews": [{ "body": "Great" }] }] } })),
    )
    .await;
    let (gateway, _composer) = fixture.gateway(&fixture.config("")).await;

    let response = execute_query(&gateway, "{ me { name reviews { body } } }").await.unwrap();

    assert_eq!(response.data, json!({ "me": { "name": "Ada", "reviews": [{ "body": "Great" }] } }));

    let requests = operation_requests(&fixture.reviews).await;
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(
        body["variables"]["representations"],
        json!([{ "id": "1", "__typename": "User" }])
    );
}

#[tokio::test]
async fn dependent_requests_wait_for_the_parent_response() {
    let fixture = TestFixture::setup().await;
    let arrivals: Arc<Mutex<Vec<(&'static str, Instant)>>> = Arc::default();

    let recorded = Arc::clone(&arrivals);
    Mock::given(body_string_contains("me"))
        .and(body_string_contains("__typename"))
        .respond_with(move |_: &Request| {
            recorded.lock().unwrap().push(("accounts", Instant::now()));
            data(json!({ "data": { "me": { "name": "Ada", "id": "1", "__typename": "User" } } }))
                .set_delay(Duration::from_millis(300))
        })
        .mount(&fixture.accounts)
        .await;

    let recorded = Arc::clone(&arrivals);
    Mock::given(body_string_contains("_entities"))
        .respond_with(move |_: &Request| {
            recorded.lock().unwrap().push(("reviews", Instant::now()));
            data(json!({ "data": { "_entities": [{ "reviews": [] }] } }))
        })
        .mount(&fixture.reviews)
        .await;
    let (gateway, _composer) = fixture.gateway(&fixture.config("")).await;

    let response = execute_query(&gateway, "{ me { name reviews { body } } }").await.unwrap();
    assert_eq!(response.data, json!({ "me": { "name": "Ada", "reviews": [] } }));

    let arrivals = arrivals.lock().unwrap();
    assert_eq!(
        arrivals.iter().map(|(subgraph, _)| *subgraph).collect::<Vec<_>>(),
        vec!["accounts", "reviews"]
    );
    assert!(arrivals[1].1.duration_since(arrivals[0].1) >= Duration::from_millis(300));
}

#[tokio::test]
async fn entity_responses_without_entities_are_malformed() {
    let fixture = TestFixture::setup().await;
    respond(
        &fixture.accounts,
        "me",
        data(json!({ "data": { "me": { "name": "Ada", "id": "1", "__typename": "User" } } })),
    )
    .await;
    respond(&fixture.reviews, "_entities", data(json!({ "data": { "_entities": null } }))).await;
    let (gateway, _composer) = fixture.gateway(&fixture.config("")).await;

    let response = execute_query(&gateway, "{ me { name reviews { body } } }").await.unwrap();

    assert_eq!(response.data, json!({ "me": { "name": "Ada", "reviews": null } }));
    assert_eq!(response.errors.len(), 1);
    let error = serde_json::to_value(&response.errors[0]).unwrap();
    assert_eq!(error["path"], json!(["me", "reviews"]));
    assert_eq!(error["extensions"]["code"], "SUBREQUEST_MALFORMED_RESPONSE");
    assert_eq!(error["extensions"]["service"], "reviews");
}

#[tokio::test]
async fn entity_steps_without_representations_are_skipped() {
    let fixture = TestFixture::setup().await;
    respond(&fixture.accounts, "me", data(json!({ "data": { "me": null } }))).await;
    let (gateway, _composer) = fixture.gateway(&fixture.config("")).await;

    let response = execute_query(&gateway, "{ me { name reviews { body } } }").await.unwrap();

    assert_eq!(response.data, json!({ "me": null }));
    assert!(operation_requests(&fixture.reviews).await.is_empty());
}

#[tokio::test]
async fn allow_list_forwards_only_allowed_headers() {
    let fixture = TestFixture::setup().await;
    respond(&fixture.accounts, "me", data(json!({ "data": { "me": { "name": "Ada" } } }))).await;
    let config = fixture.config("headers:\n  mode: allow_list\n  names: [Authorization]\n");
    let (gateway, _composer) = fixture.gateway(&config).await;

    execute_with_headers(&gateway, "{ me { name } }", client_headers())
        .await
        .unwrap();

    let requests = operation_requests(&fixture.accounts).await;
    let headers = &requests[0].headers;
    assert_eq!(headers.get("authorization").unwrap(), "Bearer token");
    assert!(headers.get("cookie").is_none());
    assert!(headers.get("x-tenant").is_none());
}

#[tokio::test]
async fn block_list_forwards_everything_else() {
    let fixture = TestFixture::setup().await;
    respond(&fixture.accounts, "me", data(json!({ "data": { "me": { "name": "Ada" } } }))).await;
    let config = fixture.config("headers:\n  mode: block_list\n  names: [cookie]\n");
    let (gateway, _composer) = fixture.gateway(&config).await;

    execute_with_headers(&gateway, "{ me { name } }", client_headers())
        .await
        .unwrap();

    let requests = operation_requests(&fixture.accounts).await;
    let headers = &requests[0].headers;
    assert_eq!(headers.get("authorization").unwrap(), "Bearer token");
    assert_eq!(headers.get("x-tenant").unwrap(), "acme");
    assert!(headers.get("cookie").is_none());
}

#[tokio::test]
async fn failing_subgraph_yields_partial_data() {
    let fixture = TestFixture::setup().await;
    respond(&fixture.accounts, "me", data(json!({ "data": { "me": { "name": "Ada" } } }))).await;
    respond(&fixture.products, "topProducts", ResponseTemplate::new(500)).await;
    let (gateway, _composer) = fixture.gateway(&fixture.config("")).await;

    let response = execute_query(&gateway, "{ me { name } topProducts { name } }")
        .await
        .unwrap();

    assert_eq!(response.data, json!({ "me": { "name": "Ada" }, "topProducts": null }));
    assert_eq!(response.errors.len(), 1);
    let error = serde_json::to_value(&response.errors[0]).unwrap();
    assert_eq!(error["path"], json!(["topProducts"]));
    assert_eq!(error["extensions"]["code"], "SUBREQUEST_HTTP_ERROR");
    assert_eq!(error["extensions"]["service"], "products");
}

#[tokio::test]
async fn slow_subgraphs_time_out_independently() {
    let fixture = TestFixture::setup().await;
    respond(&fixture.accounts, "me", data(json!({ "data": { "me": { "name": "Ada" } } }))).await;
    respond(
        &fixture.products,
        "topProducts",
        data(json!({ "data": { "topProducts": [] } })).set_delay(Duration::from_secs(5)),
    )
    .await;
    let (gateway, _composer) = fixture.gateway(&fixture.config("subgraph_timeout_ms: 300\n")).await;

    let started = Instant::now();
    let response = execute_query(&gateway, "{ me { name } topProducts { name } }")
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(response.data["me"], json!({ "name": "Ada" }));
    assert_eq!(response.data["topProducts"], Value::Null);
    let error = serde_json::to_value(&response.errors[0]).unwrap();
    assert_eq!(error["extensions"]["code"], "SUBREQUEST_TIMEOUT");
}

#[tokio::test]
async fn subgraph_errors_are_rerooted_onto_client_paths() {
    let fixture = TestFixture::setup().await;
    respond(
        &fixture.accounts,
        "users",
        data(json!({ "data": { "users": [
            { "id": "1", "__typename": "User" },
            { "id": "2", "__typename": "User" }
        ] } })),
    )
    .await;
    respond(
        &fixture.reviews,
        "_entities",
        data(json!({
            "data": { "_entities": [{ "reviews": [] }, { "reviews": null }] },
            "errors": [{ "message": "reviews unavailable", "path": ["_entities", 1, "reviews"] }]
        })),
    )
    .await;
    let (gateway, _composer) = fixture.gateway(&fixture.config("")).await;

    let response = execute_query(&gateway, "{ users { reviews { body } } }").await.unwrap();

    assert_eq!(response.data, json!({ "users": [{ "reviews": [] }, { "reviews": null }] }));
    let error = serde_json::to_value(&response.errors[0]).unwrap();
    assert_eq!(error["message"], "reviews unavailable");
    assert_eq!(error["path"], json!(["users", 1, "reviews"]));
    assert_eq!(error["extensions"]["service"], "reviews");
}

#[tokio::test]
async fn all_failed_steps_are_an_execution_error() {
    let fixture = TestFixture::setup().await;
    respond(&fixture.accounts, "me", ResponseTemplate::new(502)).await;
    respond(&fixture.products, "topProducts", data(json!({ "unexpected": true }))).await;
    let (gateway, _composer) = fixture.gateway(&fixture.config("")).await;

    let err = execute_query(&gateway, "{ me { name } topProducts { name } }")
        .await
        .unwrap_err();

    let GatewayError::Execution(ExecutionError::AllStepsFailed { errors }) = err else {
        panic!("expected every step to fail");
    };
    let mut codes: Vec<_> = errors
        .iter()
        .map(|error| error.extensions.as_ref().unwrap()["code"].as_str().unwrap().to_string())
        .collect();
    codes.sort();
    assert_eq!(codes, vec!["SUBREQUEST_HTTP_ERROR", "SUBREQUEST_MALFORMED_RESPONSE"]);
}

#[tokio::test]
async fn planning_errors_are_reported_before_dispatch() {
    let fixture = TestFixture::setup().await;
    let (gateway, _composer) = fixture.gateway(&fixture.config("")).await;

    let err = execute_query(&gateway, "{ me { password } }").await.unwrap_err();

    assert!(matches!(err, GatewayError::Planning(_)));
    assert!(operation_requests(&fixture.accounts).await.is_empty());
}

#[tokio::test]
async fn startup_fails_after_bounded_retries() {
    let fixture = TestFixture::setup().await;
    let broken = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(503))
        .mount(&broken)
        .await;

    let config = switchyard::GatewayConfig::from_yaml(&format!(
        "subgraphs:\n  - name: accounts\n    url: {}/graphql\n  \
         - name: broken\n    url: {}/graphql\n\
         startup:\n  max_attempts: 2\n  initial_backoff_ms: 10\n",
        fixture.accounts.uri(),
        broken.uri(),
    ))
    .unwrap();

    let composer = switchyard::SchemaComposer::new(
        config.registry().unwrap(),
        Arc::new(switchyard::HttpSchemaFetcher::new(config.subgraph_timeout())),
    );
    let err = composer.bootstrap(&config.startup).await.unwrap_err();

    assert!(matches!(
        err,
        CompositionError::Fetch { ref subgraph, cause: FetchError::Status(503) }
            if subgraph == "broken"
    ));
    assert_eq!(broken.received_requests().await.unwrap().len(), 2);
    assert!(composer.current().is_none());
}

#[tokio::test]
async fn failed_refresh_keeps_serving_the_previous_schema() {
    let fixture = TestFixture::setup().await;
    let (gateway, composer) = fixture.gateway(&fixture.config("")).await;
    let before = gateway.schema().unwrap();

    fixture.reviews.reset().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .mount(&fixture.reviews)
        .await;

    let err = composer.refresh().await.unwrap_err();
    assert_eq!(err.subgraph(), "reviews");
    assert!(std::sync::Arc::ptr_eq(&before, &gateway.schema().unwrap()));

    respond(&fixture.accounts, "me", data(json!({ "data": { "me": { "name": "Ada" } } }))).await;
    let response = execute_query(&gateway, "{ me { name } }").await.unwrap();
    assert_eq!(response.data, json!({ "me": { "name": "Ada" } }));
}

#[tokio::test]
async fn refresh_swaps_in_a_changed_schema() {
    let fixture = TestFixture::setup().await;
    let (gateway, composer) = fixture.gateway(&fixture.config("")).await;
    assert!(execute_query(&gateway, "{ me { email } }").await.is_err());

    fixture.accounts.reset().await;
    serve_sdl(
        &fixture.accounts,
        &ACCOUNTS_SDL.replace("username: String", "username: String\n        email: String"),
    )
    .await;
    let email = json!({ "data": { "me": { "email": "ada@example.com" } } });
    respond(&fixture.accounts, "email", data(email)).await;

    assert!(composer.refresh().await.unwrap());
    assert!(!composer.refresh().await.unwrap());

    let response = execute_query(&gateway, "{ me { email } }").await.unwrap();
    assert_eq!(response.data, json!({ "me": { "email": "ada@example.com" } }));
}
