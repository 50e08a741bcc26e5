//! HTTP surface of the exchange.
//!
//! | route                         | purpose                               |
//! |-------------------------------|---------------------------------------|
//! | `POST /negotiate`             | register a client, returns its id     |
//! | `GET /ws?connectionId=`       | websocket upgrade                     |
//! | `GET /longpoll?connectionId=` | wait for client-bound calls           |
//! | `POST /call?connectionId=`    | submit a server call (long-poll side) |
//! | anything else                 | the generated client script           |

use axum::{
    Json, Router,
    body::Bytes,
    extract::{OriginalUri, Query, State, WebSocketUpgrade},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::debug;

use crate::envelope::{Envelope, Negotiation, NegotiationResponse, TransportKind};
use crate::error::RelayError;
use crate::exchange::Exchange;

#[derive(Debug, Deserialize)]
pub struct ConnectionQuery {
    #[serde(rename = "connectionId")]
    pub connection_id: Option<String>,
}

impl ConnectionQuery {
    fn require(self) -> Result<String, RelayError> {
        self.connection_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RelayError::Decode("missing connectionId".into()))
    }
}

/// Router for every exchange operation. Mount it with `Router::nest`.
pub fn routes(exchange: Exchange) -> Router {
    Router::new()
        .route("/negotiate", post(negotiate))
        .route("/ws", get(upgrade_socket))
        .route("/longpoll", get(long_poll))
        .route("/call", post(call_server))
        .route("/", get(script_at_root))
        .route("/{*path}", get(script_at_path))
        .with_state(exchange)
}

async fn negotiate(State(exchange): State<Exchange>, body: Bytes) -> Result<Response, RelayError> {
    let negotiation: Negotiation = if body.is_empty() {
        Negotiation::default()
    } else {
        serde_json::from_slice(&body)?
    };
    let transport: TransportKind = negotiation.transport.parse()?;
    let connection_id = exchange.negotiate(transport).await;
    Ok(Json(NegotiationResponse { connection_id }).into_response())
}

async fn upgrade_socket(
    State(exchange): State<Exchange>,
    Query(query): Query<ConnectionQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, RelayError> {
    let connection_id = query.require()?;
    exchange
        .require_client(&connection_id, TransportKind::WebSocket)
        .await?;
    Ok(ws.on_upgrade(move |socket| async move { exchange.connect(connection_id, socket).await }))
}

async fn long_poll(
    State(exchange): State<Exchange>,
    Query(query): Query<ConnectionQuery>,
) -> Result<Json<Vec<Envelope>>, RelayError> {
    let connection_id = query.require()?;
    Ok(Json(exchange.await_long_poll(&connection_id).await?))
}

async fn call_server(
    State(exchange): State<Exchange>,
    Query(query): Query<ConnectionQuery>,
    body: Bytes,
) -> Result<StatusCode, RelayError> {
    let text = std::str::from_utf8(&body).map_err(|e| RelayError::Decode(e.to_string()))?;
    let envelope = Envelope::decode(text)?;
    let connection_id = match query.connection_id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => envelope.connection_id.clone(),
    };
    exchange.accept_server_call(&connection_id, envelope).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Script requested at the mount point itself: the route is the full path.
async fn script_at_root(State(exchange): State<Exchange>, OriginalUri(uri): OriginalUri) -> Response {
    let route = uri.path().trim_end_matches('/').to_string();
    serve_script(&exchange, &route).await
}

/// Script requested under the mount point, e.g. `/relayr/client.js`: the
/// route is everything before the last segment.
async fn script_at_path(State(exchange): State<Exchange>, OriginalUri(uri): OriginalUri) -> Response {
    serve_script(&exchange, script_route(uri.path())).await
}

fn script_route(path: &str) -> &str {
    match path.rfind('/') {
        Some(index) => &path[..index],
        None => "",
    }
}

async fn serve_script(exchange: &Exchange, route: &str) -> Response {
    debug!(route, "serving client script");
    let script = exchange.client_script(route).await;
    (
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        script.to_string(),
    )
        .into_response()
}
