use crate::chain::tx_sender::TransactionSubmitter;
use crate::config::WebUIConfig;
use crate::lifecycle::{KeepController, KeepRecord};
use crate::tracking::TaskHandle;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::{serve, Json};
use futures::future::BoxFuture;
use prometheus::{default_registry, Encoder, TextEncoder};
use std::fmt::Write;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Wrapper to make Axum understand how to convert anyhow::Error into a 500
/// response.
pub(crate) struct AnyhowErrorWrapper(anyhow::Error);

impl From<anyhow::Error> for AnyhowErrorWrapper {
    fn from(e: anyhow::Error) -> Self {
        AnyhowErrorWrapper(e)
    }
}

impl IntoResponse for AnyhowErrorWrapper {
    fn into_response(self) -> Response<Body> {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{:?}", self.0)).into_response()
    }
}

pub(crate) async fn metrics() -> Result<String, AnyhowErrorWrapper> {
    let metric_families = default_registry().gather();
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(anyhow::Error::from)?;
    Ok(String::from_utf8(buffer).map_err(anyhow::Error::from)?)
}

#[derive(Clone)]
struct WebServerState {
    /// Root task handle for the whole program.
    root_task_handle: Arc<TaskHandle>,
    controller: Arc<KeepController>,
    /// Absent when the chain writer does not keep a submission history.
    transactions: Option<Arc<TransactionSubmitter>>,
}

async fn debug_tasks(State(state): State<WebServerState>) -> String {
    format!("{:?}", state.root_task_handle.report())
}

async fn debug_keeps(State(state): State<WebServerState>) -> Json<Vec<KeepRecord>> {
    Json(state.controller.records())
}

async fn debug_dedup(State(state): State<WebServerState>) -> String {
    let mut report = String::new();
    for (track, active) in state.controller.dedup().active_counts() {
        let _ = writeln!(report, "{}: {}", track, active);
    }
    report
}

async fn debug_transactions(State(state): State<WebServerState>) -> String {
    let Some(submitter) = &state.transactions else {
        return "no transaction history\n".to_string();
    };
    let mut report = String::new();
    for (hash, record) in submitter.recent_transactions() {
        let _ = writeln!(
            report,
            "{} {} nonce={} gas_price={} {:?}",
            hash.as_hex(),
            record.method,
            record.nonce,
            record.gas_price,
            record.status
        );
    }
    report
}

/// Starts the web server. This is an async function that returns a future.
/// The function itself will return error if the server cannot be started.
///
/// The returned future is the one that actually serves. Dropping it stops the
/// web server.
pub async fn start_web_server(
    root_task_handle: Arc<TaskHandle>,
    controller: Arc<KeepController>,
    transactions: Option<Arc<TransactionSubmitter>>,
    config: WebUIConfig,
) -> anyhow::Result<BoxFuture<'static, anyhow::Result<()>>> {
    use futures::FutureExt;

    let router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics))
        .route("/debug/tasks", axum::routing::get(debug_tasks))
        .route("/debug/keeps", axum::routing::get(debug_keeps))
        .route("/debug/dedup", axum::routing::get(debug_dedup))
        .route("/debug/transactions", axum::routing::get(debug_transactions))
        .route("/health", axum::routing::get(|| async { "OK" }))
        .with_state(WebServerState {
            root_task_handle,
            controller,
            transactions,
        });

    let tcp_listener = TcpListener::bind(&format!("{}:{}", config.host, config.port)).await?;
    tracing::info!(address = %tcp_listener.local_addr()?, "web server listening");
    Ok(async move {
        serve(tcp_listener, router).await?;
        anyhow::Ok(())
    }
    .boxed())
}
