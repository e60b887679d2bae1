use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use engine::{ConnectionHandle, Engine, SessionRecord};
use futures::{SinkExt, StreamExt};
use shared::protocol::ClientRequest;
use storage::Storage;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

mod config;

use config::{load_settings, prepare_database_url};

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let engine = Arc::new(Engine::new(storage));

    let app = build_router(AppState { engine });

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

/// One task per participant connection. The task owns the session record and
/// the read side; engine handlers push outbound events through the handle's
/// channel, which this task drains onto the wire.
async fn ws_connection(state: AppState, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle::new(tx);
    let mut session = SessionRecord::default();

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<ClientRequest>(&text) {
            Ok(request) => state.engine.dispatch(&mut session, &handle, request).await,
            Err(error) => debug!(%error, "dropping malformed frame"),
        }
    }

    state.engine.disconnect(&mut session, &handle).await;
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        build_router(AppState {
            engine: Arc::new(Engine::new(storage)),
        })
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::get("/healthz")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ws_route_requires_an_upgrade() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::get("/ws").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        // a plain GET without the websocket handshake headers is refused
        assert_ne!(response.status(), StatusCode::OK);
    }
}
