//! # Prometheus Metrics
//!
//! Node gauges and counters, registered in a dedicated
//! [`prometheus::Registry`] with the `barter` prefix and served at
//! `/metrics`. The same router serves the node status as JSON at `/status`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use barter_protocol::{BarterNode, NodeStatus};

#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    pub connected_peers: IntGauge,
    pub chain_length: IntGauge,
    pub pending_transactions: IntGauge,
    pub open_offers: IntGauge,
    pub blocks_produced_total: IntCounter,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl NodeMetrics {
    /// Creates and registers every metric. Call once at startup.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("barter".into()), None)?;

        let blocks_produced_total = IntCounter::new(
            "blocks_produced_total",
            "Blocks sealed by this node since start",
        )?;
        registry.register(Box::new(blocks_produced_total.clone()))?;

        Ok(Self {
            connected_peers: gauge(&registry, "connected_peers", "Handshaken peers")?,
            chain_length: gauge(&registry, "chain_length", "Blocks in the local chain")?,
            pending_transactions: gauge(
                &registry,
                "pending_transactions",
                "Transactions waiting in the pending pool",
            )?,
            open_offers: gauge(&registry, "open_offers", "Offers in the OPEN state")?,
            blocks_produced_total,
            registry,
        })
    }

    /// Copies a status snapshot into the gauges.
    pub fn observe(&self, status: &NodeStatus) {
        self.connected_peers.set(to_i64(status.peers.len()));
        self.chain_length.set(to_i64(status.chain.chain_length));
        self.pending_transactions
            .set(to_i64(status.chain.pending_transactions));
        self.open_offers.set(to_i64(status.open_offers));

        let seen = self.blocks_produced_total.get();
        if status.blocks_produced > seen {
            self.blocks_produced_total.inc_by(status.blocks_produced - seen);
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// State shared by the HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub metrics: Arc<NodeMetrics>,
    pub node: Arc<BarterNode>,
}

pub fn router(state: HttpState) -> axum::Router {
    axum::Router::new()
        .route("/metrics", axum::routing::get(metrics_handler))
        .route("/status", axum::routing::get(status_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    state.metrics.observe(&state.node.status());
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

async fn status_handler(State(state): State<HttpState>) -> Json<NodeStatus> {
    Json(state.node.status())
}
