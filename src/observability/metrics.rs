//! Metrics collection and exposition.
//!
//! # Metrics
//! - `conveyor_connections_accepted_total` (counter): accepted connections
//! - `conveyor_accept_errors_total` (counter): non-transient accept failures
//! - `conveyor_active_connections` (gauge): running connection handlers
//! - `conveyor_requests_total` (counter): responses written, by status
//! - `conveyor_stage_duration_seconds` (histogram): stage timings, by stage
//! - `conveyor_request_duration_seconds` (histogram): whole request latency
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Stage names are labels, so pipelines define their own series

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::http::RequestContext;
use crate::pipeline::RequestDone;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}

pub fn record_connection_accepted() {
    counter!("conveyor_connections_accepted_total").increment(1);
}

pub fn record_accept_error() {
    counter!("conveyor_accept_errors_total").increment(1);
}

pub fn record_connection_opened() {
    gauge!("conveyor_active_connections").increment(1.0);
}

pub fn record_connection_closed() {
    gauge!("conveyor_active_connections").decrement(1.0);
}

pub fn record_request(status: u16) {
    counter!("conveyor_requests_total", "status" => status.to_string()).increment(1);
}

/// Completion observer exporting every stage timing of a request.
#[derive(Debug, Default, Clone, Copy)]
pub struct StageMetrics;

impl RequestDone for StageMetrics {
    fn request_done(&self, ctx: &RequestContext) {
        for stage in ctx.stages() {
            histogram!("conveyor_stage_duration_seconds", "stage" => stage.name.to_string())
                .record(stage.duration().as_secs_f64());
        }
        histogram!("conveyor_request_duration_seconds").record(ctx.elapsed().as_secs_f64());
    }
}
