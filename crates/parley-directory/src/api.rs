//! HTTP surface of the directory.
//!
//! Two routes: `PUT /ping` admits or refreshes a client record, `GET
//! /clients` returns the live snapshot. Everything else is a 404 with a
//! plain-text body so misdirected clients get an unambiguous answer.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Serialize;

use parley_core::User;

use crate::registry::ExpiringRegistry;

#[derive(Clone)]
pub struct ApiState {
    pub registry: ExpiringRegistry,
}

pub fn router(state: ApiState) -> Router {
    // a known path hit with the wrong method gets the same 404 as an unknown
    // path, so both fallbacks point at the generic handler
    Router::new()
        .route("/ping", put(handle_ping))
        .route("/clients", get(handle_clients))
        .fallback(handle_unknown)
        .method_not_allowed_fallback(handle_unknown)
        .with_state(state)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "directory listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

async fn handle_ping(
    State(state): State<ApiState>,
    payload: Result<Json<User>, JsonRejection>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    // missing, non-JSON, and mistyped bodies all collapse into one 400
    let Json(user) = payload.map_err(|e| {
        tracing::warn!(error = %e, "malformed registration body");
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                message: "malformed body".into(),
            }),
        )
    })?;

    if let Err(e) = user.validate() {
        tracing::warn!(error = %e, "rejected client registration");
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                message: e.to_string(),
            }),
        ));
    }

    tracing::debug!(id = %user.id, name = %user.name, "client heartbeat");
    state.registry.put(user);
    Ok(StatusCode::OK)
}

#[derive(Serialize)]
struct ClientsResponse {
    clients: Vec<User>,
}

async fn handle_clients(State(state): State<ApiState>) -> Json<ClientsResponse> {
    Json(ClientsResponse {
        clients: state.registry.list(),
    })
}

async fn handle_unknown() -> (StatusCode, &'static str) {
    (
        StatusCode::NOT_FOUND,
        "server does not support the given request",
    )
}
