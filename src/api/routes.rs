use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::api::health::{HealthSnapshot, HealthState};
use crate::api::latency::{LatencyStats, LatencySummary};
use crate::db::models::TradeRow;
use crate::db::TradeDb;
use crate::error::{AppError, Result};

#[derive(Clone)]
pub struct ApiState {
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    /// Serialized trades, one JSON document per message.
    pub trades_tx: broadcast::Sender<String>,
    pub db: Option<TradeDb>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .route("/trades/recent", get(get_recent_trades))
        .with_state(state)
}

/// Binds `addr` and serves until `shutdown` flips to true.
pub async fn serve(addr: &str, state: ApiState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Broadcast server listening on {addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    let rx = state.trades_tx.subscribe();
    ws.on_upgrade(move |socket| push_trades(socket, rx))
}

async fn push_trades(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                // Slow client: drop what it missed and keep going.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Broadcast client lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthSnapshot> {
    Json(state.health.snapshot())
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencySummary> {
    Json(state.latency.summary())
}

#[derive(Deserialize)]
pub struct RecentTradesQuery {
    pub limit: Option<i64>,
}

async fn get_recent_trades(
    State(state): State<ApiState>,
    Query(params): Query<RecentTradesQuery>,
) -> std::result::Result<Response, AppError> {
    let Some(db) = state.db.as_ref() else {
        return Ok((StatusCode::NOT_FOUND, "no trade database configured").into_response());
    };
    let limit = params.limit.unwrap_or(50).clamp(1, 1000);
    let rows: Vec<TradeRow> = db.recent_trades(limit).await?;
    Ok(Json(rows).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn state() -> ApiState {
        let (trades_tx, _) = broadcast::channel(16);
        ApiState {
            health: Arc::new(HealthState::new()),
            latency: Arc::new(LatencyStats::new()),
            trades_tx,
            db: None,
        }
    }

    async fn spawn(state: ApiState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn health_reports_counters() {
        let st = state();
        st.health.set_last_head_block(42);
        st.health.inc_trades_emitted();
        let addr = spawn(st).await;

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["last_head_block"], 42);
        assert_eq!(body["trades_emitted"], 1);
        assert_eq!(body["head_connected"], false);

        let resp = reqwest::get(format!("http://{addr}/trades/recent")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ws_clients_receive_broadcast_trades() {
        let st = state();
        let tx = st.trades_tx.clone();
        let addr = spawn(st).await;

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        while tx.receiver_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send("{\"market_slug\":\"btc-updown-5m-1\"}".to_string()).unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.into_text().unwrap(), "{\"market_slug\":\"btc-updown-5m-1\"}");
    }
}
