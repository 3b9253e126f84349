//! HTTP front door: `/graphql` over GET, POST and multipart POST, a health
//! endpoint, CORS, and a graceful drain on shutdown.

use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{
    HeaderMap, HeaderValue,
    header::{
        ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
        ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_HEADERS,
        ALLOW, CONTENT_TYPE, ORIGIN, VARY,
    },
};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{Method, Request, Response, StatusCode, body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::{conn::auto, graceful::GracefulShutdown},
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::{net::TcpListener, signal};

use crate::{
    config::UploadConfig,
    error::{ExecutionError, GatewayError, PlanningError, UploadError},
    federation_gateway::{FederationGateway, GraphQLRequest, RequestExtras},
    response::{GraphQLError, MergedResponse},
    upload::read_multipart,
};

pub const GRAPHQL_PATH: &str = "/graphql";
pub const HEALTH_PATH: &str = "/.well-known/apollo/server-health";

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type ResponseBody = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("binding {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

pub struct ServerState {
    gateway: Arc<FederationGateway>,
    uploads: UploadConfig,
}

impl ServerState {
    pub fn new(gateway: Arc<FederationGateway>, uploads: UploadConfig) -> Self {
        ServerState { gateway, uploads }
    }
}

fn full<T: Into<Bytes>>(value: T) -> ResponseBody {
    Full::new(value.into()).map_err(|never| match never {}).boxed()
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, Error> {
    TcpListener::bind(addr).await.map_err(|source| Error::Bind { addr, source })
}

/// Accepts connections until `shutdown` resolves, then waits for in-flight
/// connections to finish.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: impl Future<Output = ()>,
) {
    let builder = auto::Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    let mut shutdown = std::pin::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // Usually resource exhaustion; back off instead of spinning.
                        tracing::warn!(error = %e, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };

                let state = Arc::clone(&state);
                let service = service_fn(move |req| handle_request(req, Arc::clone(&state)));
                let connection =
                    builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                let connection = graceful.watch(connection.into_owned());

                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::debug!(%peer, error = %e, "connection closed with error");
                    }
                });
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown requested, draining connections");
                break;
            }
        }
    }

    drop(listener);

    tokio::select! {
        _ = graceful.shutdown() => tracing::info!("all connections drained"),
        _ = tokio::time::sleep(DRAIN_TIMEOUT) => {
            tracing::warn!("timed out waiting for connections to drain");
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<ResponseBody>, Infallible> {
    let origin = req.headers().get(ORIGIN).cloned();

    let mut response = match (req.method(), req.uri().path()) {
        (&Method::OPTIONS, _) => preflight(req.headers()),
        (&Method::GET, HEALTH_PATH) => json_response(StatusCode::OK, &json!({ "status": "pass" })),
        (&Method::POST, GRAPHQL_PATH) => graphql_post(req, &state).await,
        (&Method::GET, GRAPHQL_PATH) => graphql_get(req, &state).await,
        (_, GRAPHQL_PATH) => {
            let mut response =
                request_error(StatusCode::METHOD_NOT_ALLOWED, "only GET and POST are supported");
            response.headers_mut().insert(ALLOW, HeaderValue::from_static("GET, POST"));
            response
        }
        _ => request_error(StatusCode::NOT_FOUND, "not found"),
    };

    if let Some(origin) = origin {
        let headers = response.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        headers.append(VARY, HeaderValue::from_static("Origin"));
    }

    Ok(response)
}

fn preflight(request_headers: &HeaderMap) -> Response<ResponseBody> {
    let mut response = Response::new(full(""));
    *response.status_mut() = StatusCode::NO_CONTENT;

    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, POST"));
    if let Some(requested) = request_headers.get(ACCESS_CONTROL_REQUEST_HEADERS) {
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }

    response
}

async fn graphql_post(req: Request<Incoming>, state: &ServerState) -> Response<ResponseBody> {
    let (parts, body) = req.into_parts();

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if content_type.starts_with("multipart/form-data") {
        let boundary = match multer::parse_boundary(content_type) {
            Ok(boundary) => boundary,
            Err(e) => return bad_request(e.to_string()),
        };

        let multipart = read_multipart(body.into_data_stream(), &boundary, &state.uploads);
        let multipart = match multipart.await {
            Ok(multipart) => multipart,
            Err(e) => return upload_error(e),
        };

        let request: GraphQLRequest = match serde_json::from_value(multipart.operations) {
            Ok(request) => request,
            Err(e) => return bad_request(format!("invalid `operations`: {e}")),
        };

        let extras = RequestExtras {
            headers: parts.headers,
            uploads: multipart.uploads,
            read_only: false,
        };
        return execution_response(state.gateway.process_request(request, extras).await);
    }

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return bad_request(format!("failed to read request body: {e}")),
    };

    let request: GraphQLRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return bad_request(format!("invalid JSON request: {e}")),
    };

    let extras = RequestExtras {
        headers: parts.headers,
        ..Default::default()
    };
    execution_response(state.gateway.process_request(request, extras).await)
}

async fn graphql_get(req: Request<Incoming>, state: &ServerState) -> Response<ResponseBody> {
    let mut request = GraphQLRequest::default();
    let mut has_query = false;

    let query = req.uri().query().unwrap_or_default();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "query" => {
                request.query = value.into_owned();
                has_query = true;
            }
            "operationName" if !value.is_empty() => {
                request.operation_name = Some(value.into_owned());
            }
            "variables" if !value.is_empty() => match serde_json::from_str(&value) {
                Ok(variables) => request.variables = variables,
                Err(e) => return bad_request(format!("invalid `variables`: {e}")),
            },
            _ => {}
        }
    }

    if !has_query {
        return request_error(StatusCode::BAD_REQUEST, "missing `query` parameter");
    }

    let extras = RequestExtras {
        headers: req.headers().clone(),
        uploads: Vec::new(),
        read_only: true,
    };
    execution_response(state.gateway.process_request(request, extras).await)
}

fn execution_response(result: Result<MergedResponse, GatewayError>) -> Response<ResponseBody> {
    match result {
        Ok(response) => json_response(StatusCode::OK, &response),
        Err(GatewayError::Execution(ExecutionError::AllStepsFailed { errors })) => {
            json_response(StatusCode::OK, &json!({ "data": Value::Null, "errors": errors }))
        }
        Err(GatewayError::Planning(e)) => {
            let code = match e {
                PlanningError::Syntax(_) => "GRAPHQL_PARSE_FAILED",
                _ => "GRAPHQL_VALIDATION_FAILED",
            };
            let error = GraphQLError::new(e.to_string()).with_extension("code", code);
            errors_response(StatusCode::BAD_REQUEST, error)
        }
        Err(e @ GatewayError::MutationNotAllowed) => {
            request_error(StatusCode::METHOD_NOT_ALLOWED, &e.to_string())
        }
        Err(e @ GatewayError::SchemaUnavailable) => {
            request_error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
        }
    }
}

fn upload_error(e: UploadError) -> Response<ResponseBody> {
    let status = match e {
        UploadError::FileTooLarge(..) => StatusCode::PAYLOAD_TOO_LARGE,
        UploadError::Spool(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    tracing::debug!(error = %e, "rejected multipart request");
    request_error(status, &e.to_string())
}

fn bad_request(message: String) -> Response<ResponseBody> {
    request_error(StatusCode::BAD_REQUEST, &message)
}

fn request_error(status: StatusCode, message: &str) -> Response<ResponseBody> {
    errors_response(status, GraphQLError::new(message))
}

fn errors_response(status: StatusCode, error: GraphQLError) -> Response<ResponseBody> {
    json_response(status, &json!({ "errors": [error] }))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<ResponseBody> {
    let body = match serde_json::to_vec(body) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize response");
            return internal_server_error();
        }
    };

    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn internal_server_error() -> Response<ResponseBody> {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
