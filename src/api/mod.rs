//! HTTP surface.
//!
//! Mechanical adapter between the wire and the chain: one route starts a
//! chain run and streams the multiplexer back as newline-delimited JSON;
//! the rest are introspection (schema, heartbeat, per-stage liveness).
//! Client disconnects are detected by the response stream being dropped,
//! which funnels into the same force-cleanup as a superseding request.

use crate::chain::Chain;
use crate::config::Config;
use crate::protocol::ApiRequest;
use actix_web::{App, HttpResponse, HttpServer, get, middleware, post, web};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Shared server state: the chain and the admission semaphore capping
/// simultaneously admitted requests.
pub struct AppState {
    chain: Chain,
    admission: Arc<Semaphore>,
}

impl AppState {
    pub fn new(chain: Chain, max_sessions: usize) -> Self {
        Self {
            chain,
            admission: Arc::new(Semaphore::new(max_sessions)),
        }
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }
}

#[post("/input")]
async fn input(
    state: web::Data<AppState>,
    request: web::Json<ApiRequest>,
) -> Result<HttpResponse, actix_web::Error> {
    let request = request.into_inner();
    if request.user.is_empty() {
        return Err(actix_web::error::ErrorBadRequest("user must not be empty"));
    }
    log::info!(
        "request from user {} (entry {}, streamly {})",
        request.user,
        request.entry,
        request.streamly
    );

    // Admission cap. The permit rides inside the response stream and is
    // released when the stream ends or the client disconnects.
    let permit = state
        .admission
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| actix_web::error::ErrorServiceUnavailable("server is shutting down"))?;

    let payload = state
        .chain
        .handle_input(&request)
        .map_err(actix_web::error::ErrorUnprocessableEntity)?;
    state
        .chain
        .serve(request.streamly, &request.user, request.entry, payload)
        .map_err(actix_web::error::ErrorUnprocessableEntity)?;

    let chunks = state.chain.drain(&request.user);
    let body = futures::stream::unfold((chunks, permit), |(mut chunks, permit)| async move {
        chunks
            .next()
            .await
            .map(|chunk| (Ok::<_, actix_web::Error>(Bytes::from(chunk.to_line())), (chunks, permit)))
    });

    Ok(HttpResponse::Ok()
        .content_type("application/x-ndjson")
        .streaming(body))
}

#[get("/schema")]
async fn schema() -> HttpResponse {
    HttpResponse::Ok().json(ApiRequest::schema())
}

#[derive(Debug, Deserialize)]
struct HeartbeatQuery {
    user: String,
}

#[get("/heartbeat")]
async fn heartbeat(
    state: web::Data<AppState>,
    query: web::Query<HeartbeatQuery>,
) -> HttpResponse {
    let mut report = state.chain.heartbeat().await;
    if let Some(map) = report.as_object_mut() {
        map.insert("user".to_string(), serde_json::json!(query.user));
    }
    HttpResponse::Ok().json(report)
}

#[get("/stages/{name}/awake")]
async fn stage_awake(
    state: web::Data<AppState>,
    name: web::Path<String>,
) -> Result<HttpResponse, actix_web::Error> {
    match state.chain.stage_alive(&name).await {
        Some(alive) => Ok(HttpResponse::Ok().json(serde_json::json!({ "awake": alive }))),
        None => Err(actix_web::error::ErrorNotFound(format!(
            "no such stage: {}",
            name.as_str()
        ))),
    }
}

/// Registers all routes. Shared between [`run`] and the test harness.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(input)
        .service(schema)
        .service(heartbeat)
        .service(stage_awake);
}

/// Binds and runs the API server until shutdown.
pub async fn run(config: &Config, chain: Chain) -> std::io::Result<()> {
    let state = web::Data::new(AppState::new(chain, config.server.max_sessions));
    let host = config.server.host.clone();
    let port = config.server.port;

    log::info!("listening on {}:{}", host, port);
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(configure)
    })
    .bind((host, port))?
    .run()
    .await
}
