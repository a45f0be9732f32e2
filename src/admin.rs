//! Admin HTTP API: event ingress and diagnostics.
//!
//! `GET /health` and `GET /version` are open. Event submission and state
//! dumps require the bearer token.

use crate::error::{json_error_response, ErrorCode};
use crate::events::EventSender;
use crate::model::{Endpoints, EventType, Route};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

type AdminResponse = Response<Full<Bytes>>;

fn reply(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> AdminResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(body.into()))
        .expect("static status and header are valid")
}

fn json_reply(status: StatusCode, body: impl Into<Bytes>) -> AdminResponse {
    reply(status, "application/json", body)
}

#[derive(Debug, Deserialize)]
struct RouteEvent {
    #[serde(rename = "type")]
    event: EventType,
    route: Route,
}

#[derive(Debug, Deserialize)]
struct EndpointsEvent {
    #[serde(rename = "type")]
    event: EventType,
    endpoints: Endpoints,
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    events: EventSender,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, events: EventSender, shutdown_rx: watch::Receiver<bool>, auth_token: String) -> Self {
        Self {
            bind_addr,
            events,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API listening");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => error!(error = %e, "Admin accept failed"),
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Admin API stopped");
                        return Ok(());
                    }
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let events = self.events.clone();
        let auth_token = Arc::clone(&self.auth_token);
        tokio::spawn(async move {
            if let Err(e) = serve_admin_connection(stream, events, auth_token).await {
                debug!(%peer, error = %e, "Admin connection closed with error");
            }
        });
    }
}

async fn serve_admin_connection(stream: TcpStream, events: EventSender, auth_token: Arc<String>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let events = events.clone();
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, events, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))
}

/// Accepts `Authorization: Bearer <token>` or the bare token
fn authorized(req: &Request<hyper::body::Incoming>, expected_token: &str) -> bool {
    let Some(header) = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    header.strip_prefix("Bearer ").unwrap_or(header) == expected_token
}

async fn read_json<T: DeserializeOwned>(req: Request<hyper::body::Incoming>) -> Result<T, AdminResponse> {
    let body = req
        .collect()
        .await
        .map_err(|e| json_error_response(ErrorCode::InvalidPayload, format!("Failed to read body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body)
        .map_err(|e| json_error_response(ErrorCode::InvalidPayload, format!("Invalid JSON: {}", e)))
}

fn outcome(result: crate::error::Result<()>) -> AdminResponse {
    match result {
        Ok(()) => json_reply(StatusCode::OK, r#"{"status":"applied"}"#),
        Err(e) => json_error_response(e.error_code(), e.to_string()),
    }
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    events: EventSender,
    auth_token: Arc<String>,
) -> Result<AdminResponse, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    debug!(%method, %path, "Admin request");

    let resp = match (&method, path.as_str()) {
        (&Method::GET, "/health") => reply(StatusCode::OK, "text/plain", "ok"),

        (&Method::GET, "/version") => json_reply(
            StatusCode::OK,
            serde_json::json!({ "name": PKG_NAME, "version": VERSION }).to_string(),
        ),

        (_, "/events/routes" | "/events/endpoints" | "/state") if !authorized(&req, &auth_token) => {
            warn!(%path, "Unauthorized admin API request");
            json_error_response(ErrorCode::Unauthorized, "unauthorized")
        }

        (&Method::POST, "/events/routes") => match read_json::<RouteEvent>(req).await {
            Ok(ev) => outcome(events.route(ev.event, ev.route).await),
            Err(resp) => resp,
        },

        (&Method::POST, "/events/endpoints") => match read_json::<EndpointsEvent>(req).await {
            Ok(ev) => outcome(events.endpoints(ev.event, ev.endpoints).await),
            Err(resp) => resp,
        },

        (&Method::GET, "/state") => match events.snapshot().await {
            Ok(table) => match table.to_snapshot() {
                Ok(body) => json_reply(StatusCode::OK, body),
                Err(e) => json_error_response(ErrorCode::CommitFailed, e.to_string()),
            },
            Err(e) => json_error_response(e.error_code(), e.to_string()),
        },

        _ => json_error_response(ErrorCode::NotFound, "not found"),
    };

    Ok(resp)
}
