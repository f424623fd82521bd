//! Handler read-server.
//!
//! Every configured handler is served at `GET /{name}`, its query string
//! validated against the handler's declared `query_parameters`.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/{name}` | Run a handler; the body is its payload |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "missing required parameter 'line'" } }
//! ```
//!
//! Error codes: `bad_request` (400), `forbidden` (403), `not_found` (404),
//! `internal` (500). A handler rejecting a parameter value with a
//! `ParamError` is a `bad_request`. Any other failure is logged; its
//! response carries no detail.
//!
//! # Access
//!
//! Requests are accepted from the addresses in `[server].allowed_hosts`.
//! `localhost` matches every loopback address and `*` allows everyone.

use anyhow::{bail, Result};
use axum::{
    extract::{rejection::QueryRejection, ConnectInfo, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use mobility_harvester_core::component::{Handler, HandlerContext, ParamError, ParamSpec, Params};
use mobility_harvester_core::graph::NodeId;
use mobility_harvester_core::store::Store;

use crate::pipeline::Pipeline;

/// Client addresses allowed to call handlers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllowList {
    any: bool,
    loopback: bool,
    addrs: Vec<IpAddr>,
}

impl AllowList {
    pub fn from_hosts(hosts: &[String]) -> Result<Self> {
        let mut list = AllowList::default();
        for host in hosts {
            match host.trim() {
                "*" => list.any = true,
                "localhost" => list.loopback = true,
                other => match other.parse::<IpAddr>() {
                    Ok(ip) => list.addrs.push(ip),
                    Err(_) => bail!("allowed host '{}' is not an IP address", other),
                },
            }
        }
        Ok(list)
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.any || (self.loopback && ip.is_loopback()) || self.addrs.contains(&ip)
    }
}

struct ServedHandler {
    handler: Arc<dyn Handler>,
    parameters: BTreeMap<String, ParamSpec>,
}

#[derive(Clone)]
struct AppState {
    handlers: Arc<BTreeMap<String, ServedHandler>>,
    ctx: HandlerContext,
    allow: Arc<AllowList>,
}

/// Build the router for the given handlers.
pub fn router(
    store: Arc<dyn Store>,
    pipeline: &Pipeline,
    handlers: &[NodeId],
    allow: AllowList,
) -> Router {
    let served: BTreeMap<String, ServedHandler> = handlers
        .iter()
        .filter_map(|&id| {
            let spec = pipeline.spec(id);
            pipeline.handler(id).map(|handler| {
                (
                    spec.name.clone(),
                    ServedHandler {
                        handler,
                        parameters: spec.query_parameters.clone(),
                    },
                )
            })
        })
        .collect();

    let state = AppState {
        handlers: Arc::new(served),
        ctx: HandlerContext::new(store),
        allow: Arc::new(allow),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/{name}", get(handle_query))
        .layer(cors)
        .with_state(state)
}

/// Serve `router` on an already bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, router: Router) -> Result<()> {
    info!("read-server listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn forbidden() -> AppError {
    AppError {
        status: StatusCode::FORBIDDEN,
        code: "forbidden".to_string(),
        message: "client address not allowed".to_string(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal() -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: "handler failed".to_string(),
    }
}

// ============ Routes ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_query(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
) -> Result<Response, AppError> {
    if !state.allow.allows(peer.ip()) {
        return Err(forbidden());
    }

    let served = state
        .handlers
        .get(&name)
        .ok_or_else(|| not_found(format!("no handler named '{}'", name)))?;

    let Query(raw) = query.map_err(|e| bad_request(e.body_text()))?;
    let params =
        Params::validate(&served.parameters, &raw).map_err(|e| bad_request(e.to_string()))?;

    match served.handler.run(&params, &state.ctx).await {
        Ok(Some(payload)) => Ok((
            [(header::CONTENT_TYPE, payload.kind().content_type())],
            payload.to_bytes(),
        )
            .into_response()),
        Ok(None) => Err(not_found("no data")),
        Err(e) if e.downcast_ref::<ParamError>().is_some() => Err(bad_request(e.to_string())),
        Err(e) => {
            error!(handler = %name, "{:#}", e);
            Err(internal())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_localhost_matches_loopback() {
        let allow = AllowList::from_hosts(&hosts(&["localhost"])).unwrap();
        assert!(allow.allows("127.0.0.1".parse().unwrap()));
        assert!(allow.allows("127.0.0.2".parse().unwrap()));
        assert!(allow.allows("::1".parse().unwrap()));
        assert!(allow.allows("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!allow.allows("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_explicit_addresses_and_wildcard() {
        let allow = AllowList::from_hosts(&hosts(&["10.0.0.1"])).unwrap();
        assert!(allow.allows("10.0.0.1".parse().unwrap()));
        assert!(!allow.allows("127.0.0.1".parse().unwrap()));

        let allow = AllowList::from_hosts(&hosts(&["*"])).unwrap();
        assert!(allow.allows("203.0.113.9".parse().unwrap()));

        assert!(!AllowList::default().allows("127.0.0.1".parse().unwrap()));
        assert!(AllowList::from_hosts(&hosts(&["example.org"])).is_err());
    }
}
