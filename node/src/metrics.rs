// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::ChannelError;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry, Encoder,
    HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;

const TX_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.5, 1.0, 2.0, 3.0, 5.0, 8.0, 12.0, 15.0, 20.0, 30.0, 45.0, 60.0, 90.0, 120.0, 180.0, 300.0,
    600.0,
];

#[derive(Clone, Debug)]
pub struct ChannelMetrics {
    pub(crate) open_channel_events: IntCounterVec,
    pub(crate) tcb_opens: IntCounterVec,
    pub(crate) auth_requests: IntCounterVec,
    pub(crate) auth_synced_channels: IntCounter,
    pub(crate) deposit_events: IntCounter,
    pub(crate) deposit_errors: IntCounter,
    pub(crate) coop_withdraw_events: IntCounter,
    pub(crate) dispute_txs: IntCounterVec,
    pub(crate) dispute_events: IntCounterVec,
    pub(crate) job_results: IntCounterVec,
    pub(crate) jobs_running: IntGaugeVec,
    pub(crate) tx_mined_latency: HistogramVec,
    pub(crate) errors: IntCounterVec,
}

impl ChannelMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            open_channel_events: register_int_counter_vec_with_registry!(
                "channel_open_channel_events",
                "Open channel attempts by result",
                &["result"],
                registry,
            )
            .unwrap(),
            tcb_opens: register_int_counter_vec_with_registry!(
                "channel_tcb_opens",
                "Trust-before-collateral open requests by result",
                &["result"],
                registry,
            )
            .unwrap(),
            auth_requests: register_int_counter_vec_with_registry!(
                "channel_auth_requests",
                "Auth requests handled by result",
                &["result"],
                registry,
            )
            .unwrap(),
            auth_synced_channels: register_int_counter_with_registry!(
                "channel_auth_synced_channels",
                "Total number of channels applied from auth acks",
                registry,
            )
            .unwrap(),
            deposit_events: register_int_counter_with_registry!(
                "channel_deposit_events",
                "Total number of deposit events observed for own channels",
                registry,
            )
            .unwrap(),
            deposit_errors: register_int_counter_with_registry!(
                "channel_deposit_errors",
                "Total number of failed deposit jobs",
                registry,
            )
            .unwrap(),
            coop_withdraw_events: register_int_counter_with_registry!(
                "channel_coop_withdraw_events",
                "Total number of cooperative withdraw events observed for own channels",
                registry,
            )
            .unwrap(),
            dispute_txs: register_int_counter_vec_with_registry!(
                "channel_dispute_txs",
                "Dispute transactions submitted by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            dispute_events: register_int_counter_vec_with_registry!(
                "channel_dispute_events",
                "Dispute events observed by event name",
                &["event"],
                registry,
            )
            .unwrap(),
            job_results: register_int_counter_vec_with_registry!(
                "channel_job_results",
                "Finished jobs by kind and result",
                &["kind", "result"],
                registry,
            )
            .unwrap(),
            jobs_running: register_int_gauge_vec_with_registry!(
                "channel_jobs_running",
                "Jobs currently being dispatched by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            tx_mined_latency: register_histogram_vec_with_registry!(
                "channel_tx_mined_latency",
                "Seconds from submission until a transaction is mined, by kind",
                &["kind"],
                TX_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            errors: register_int_counter_vec_with_registry!(
                "channel_errors",
                "Errors by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }

    pub fn record_error(&self, error: &ChannelError) {
        self.errors.with_label_values(&[error.error_type()]).inc();
    }
}

pub const METRICS_ROUTE: &str = "/metrics";

/// Serves `registry` in the Prometheus text format on [`METRICS_ROUTE`].
pub async fn start_prometheus_server(
    addr: SocketAddr,
    registry: Registry,
) -> anyhow::Result<JoinHandle<()>> {
    let app = Router::new()
        .route(METRICS_ROUTE, get(metrics_handler))
        .with_state(registry);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on {}", addr);

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server error: {:?}", e);
        }
    }))
}

async fn metrics_handler(State(registry): State<Registry>) -> (StatusCode, String) {
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            String::from_utf8_lossy(&buffer).into_owned(),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to encode metrics: {}", e),
        ),
    }
}
