//! HTTP query endpoint.
//!
//! Clients `POST` a raw query string to any path and receive the matching
//! records as a JSON array streamed one record at a time.
//!
//! # Responses
//!
//! | Case | Status | Body |
//! |------|--------|------|
//! | Query ran | `200` | streamed `[ … ]` |
//! | Body over `max_body_size` | `413` | `{"error":"The query was too long."}` |
//! | Executor rejected the query | `400` | `{"error":"<message>"}` |
//! | `OPTIONS` | `204` | empty |
//! | Any other method | `405` | `{"error":"Only POST is supported."}` |
//!
//! Every response carries `Content-Type: application/json`,
//! `Access-Control-Allow-Origin: *` and `Access-Control-Allow-Methods: POST`.
//!
//! A `200` is committed before the first record is pulled, so a failure
//! while streaming (bad record, index error, client gone) cannot change it;
//! the transfer is cut short instead and the failure is logged.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{debug, info};

use crate::access_log::{escape_query, AccessLogFormat, RequestInfo};
use crate::body::BodyCollector;
use crate::config::Config;
use crate::error::{CollectError, ErrorEnvelope};
use crate::stream::{ChannelSink, StreamingArrayWriter};
use crate::traits::QueryExecutor;

const ONLY_POST: &str = "Only POST is supported.";

/// Shared state handed to every request.
pub struct AppState<E> {
    /// The index queries run against.
    pub executor: Arc<E>,
    pub max_body_size: usize,
    pub write_timeout: Option<Duration>,
    pub access_log: AccessLogFormat,
}

impl<E> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            max_body_size: self.max_body_size,
            write_timeout: self.write_timeout,
            access_log: self.access_log.clone(),
        }
    }
}

impl<E: QueryExecutor> AppState<E> {
    pub fn new(config: &Config, executor: Arc<E>) -> Self {
        Self {
            executor,
            max_body_size: config.server.max_body_size,
            write_timeout: config.server.write_timeout(),
            access_log: AccessLogFormat::parse(&config.access_log.format),
        }
    }
}

/// Builds the router: every path goes to the query handler.
pub fn router<E: QueryExecutor>(state: AppState<E>) -> Router {
    Router::new()
        .fallback(handle_query::<E>)
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("POST"),
        ))
        .with_state(state)
}

/// Serves on an already bound listener until `shutdown` resolves.
pub async fn serve<E, F>(listener: TcpListener, state: AppState<E>, shutdown: F) -> anyhow::Result<()>
where
    E: QueryExecutor,
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

/// Binds `[server].bind` and serves until `shutdown` resolves.
pub async fn run_server<E, F>(config: &Config, executor: Arc<E>, shutdown: F) -> anyhow::Result<()>
where
    E: QueryExecutor,
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(&config.server.bind).await?;
    serve(listener, AppState::new(config, executor), shutdown).await
}

// ============ Error response ============

/// Error response sent before any body byte is committed.
struct AppError {
    status: StatusCode,
    envelope: ErrorEnvelope,
}

impl AppError {
    fn new(status: StatusCode, err: &impl std::fmt::Display) -> Self {
        Self {
            status,
            envelope: ErrorEnvelope::from_error(err),
        }
    }

    fn content_length(&self) -> u64 {
        self.envelope.to_json().len() as u64
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope)).into_response()
    }
}

// ============ POST * ============

/// Runs one query: collect the body, execute, stream the results.
async fn handle_query<E: QueryExecutor>(State(state): State<AppState<E>>, req: Request) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let info = RequestInfo::new(peer, req.method(), req.uri(), req.version(), req.headers());

    if *req.method() == Method::OPTIONS {
        log_access(&state, info, StatusCode::NO_CONTENT, 0, "");
        return StatusCode::NO_CONTENT.into_response();
    }
    if *req.method() != Method::POST {
        let err = AppError::new(StatusCode::METHOD_NOT_ALLOWED, &ONLY_POST);
        log_access(&state, info, err.status, err.content_length(), "");
        let mut response = err.into_response();
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("POST"));
        return response;
    }

    let body = req.into_body().into_data_stream();
    let query = match BodyCollector::new(state.max_body_size).collect(body).await {
        Ok(query) => query,
        Err(err) => {
            let status = match err {
                CollectError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                CollectError::Body(_) => StatusCode::BAD_REQUEST,
            };
            debug!(error = %err, "request body rejected");
            let err = AppError::new(status, &err);
            log_access(&state, info, err.status, err.content_length(), "");
            return err.into_response();
        }
    };

    let seq = match state.executor.execute(&query).await {
        Ok(seq) => seq,
        Err(err) => {
            debug!(error = %err, "query rejected");
            let err = AppError::new(StatusCode::BAD_REQUEST, &err);
            log_access(&state, info, err.status, err.content_length(), &query);
            return err.into_response();
        }
    };

    let (sink, body) = ChannelSink::channel();
    let writer = StreamingArrayWriter::new(sink).with_write_timeout(state.write_timeout);
    tokio::spawn(async move {
        let outcome = writer.stream(seq).await;
        log_access(&state, info, StatusCode::OK, outcome.bytes, &query);
    });

    Response::new(body)
}

fn log_access<E>(state: &AppState<E>, info: RequestInfo, status: StatusCode, bytes: u64, query: &str) {
    let line = state.access_log.format(&info.finish(status, bytes));
    info!(target: "indexserve::access", "{} | {}", line, escape_query(query));
}
