//! Operation latency and in-flight metrics for the exportd controllers.
//!
//! The manager caches a start timestamp per `(operation, resource uid)` and
//! observes the elapsed time into a Prometheus histogram when the operation
//! reaches a terminal state. A delete finishing while a create for the same
//! resource is still pending records the pending create as `cancel` — the
//! user deleted the export before it ever materialized.
//!
//! Exposition is the Prometheus text format on `GET /metrics`.

#![warn(missing_docs)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

const SUBSYSTEM: &str = "export_controller";
const UNKNOWN_DRIVER: &str = "unknown";
const IN_FLIGHT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

const LATENCY_BUCKETS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

/// Tracked operation names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// From first sight of an unprovisioned export until creationTime is set.
    CreateExport,
    /// From first sight of an export until readyToUse becomes true.
    CreateExportAndReady,
    /// From deletion timestamp until the last finalizer is removed.
    DeleteExport,
}

impl Operation {
    /// Label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateExport => "CreateExport",
            Self::CreateExportAndReady => "CreateExportAndReady",
            Self::DeleteExport => "DeleteExport",
        }
    }
}

/// Provisioning mode of the export an operation acts on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportKind {
    /// Export cut from a PVC.
    Dynamic,
    /// Pre-existing export adopted by reference.
    PreProvisioned,
}

impl ExportKind {
    /// Label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dynamic => "dynamic",
            Self::PreProvisioned => "pre-provisioned",
        }
    }
}

/// Terminal status of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationStatus {
    /// The operation completed.
    Success,
    /// A delete arrived before the operation completed.
    Cancel,
    /// Terminal state with no specific status.
    Unknown,
}

impl OperationStatus {
    /// Label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Cancel => "cancel",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct OperationKey {
    operation: Operation,
    resource_id: String,
}

#[derive(Clone)]
struct OperationValue {
    driver: String,
    kind: ExportKind,
    started: Instant,
}

/// Concurrent operation-metrics manager.
pub struct OperationMetrics {
    cache: Mutex<HashMap<OperationKey, OperationValue>>,
    registry: Registry,
    latency: HistogramVec,
    in_flight: IntGauge,
}

impl OperationMetrics {
    /// Create a manager with its own registry.
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        let latency = HistogramVec::new(
            HistogramOpts::new(
                format!("{SUBSYSTEM}_operation_total_seconds"),
                "Total number of seconds spent by the controller on an operation",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &[
                "driver_name",
                "operation_name",
                "export_type",
                "operation_status",
            ],
        )
        .expect("valid histogram definition");

        let in_flight = IntGauge::with_opts(Opts::new(
            format!("{SUBSYSTEM}_operations_in_flight"),
            "Total number of operations in flight",
        ))
        .expect("valid gauge definition");

        registry
            .register(Box::new(latency.clone()))
            .expect("histogram registers once");
        registry
            .register(Box::new(in_flight.clone()))
            .expect("gauge registers once");

        Arc::new(Self {
            cache: Mutex::new(HashMap::new()),
            registry,
            latency,
            in_flight,
        })
    }

    /// Cache the start time of an operation. No-op if the operation is
    /// already tracked, so retried reconciliations keep the original start.
    pub fn operation_start(&self, operation: Operation, resource_id: &str, driver: &str, kind: ExportKind) {
        let mut cache = self.cache.lock();
        let key = OperationKey {
            operation,
            resource_id: resource_id.to_string(),
        };
        cache.entry(key).or_insert_with(|| OperationValue {
            driver: if driver.is_empty() {
                UNKNOWN_DRIVER.to_string()
            } else {
                driver.to_string()
            },
            kind,
            started: Instant::now(),
        });
        self.in_flight.set(cache.len() as i64);
    }

    /// Drop a tracked operation without recording a data point.
    pub fn drop_operation(&self, operation: Operation, resource_id: &str) {
        let mut cache = self.cache.lock();
        cache.remove(&OperationKey {
            operation,
            resource_id: resource_id.to_string(),
        });
        self.in_flight.set(cache.len() as i64);
    }

    /// Observe a terminal state for an operation and remove it. No-op when
    /// the operation was never started. Recording a `DeleteExport` also
    /// records still-pending create operations for the same resource as
    /// `cancel` with the same duration.
    pub fn record_metrics(
        &self,
        operation: Operation,
        resource_id: &str,
        status: OperationStatus,
        driver: &str,
    ) {
        let mut cache = self.cache.lock();
        let key = OperationKey {
            operation,
            resource_id: resource_id.to_string(),
        };
        let Some(value) = cache.remove(&key) else {
            return;
        };

        let driver = if driver.is_empty() || driver == UNKNOWN_DRIVER {
            value.driver.clone()
        } else {
            driver.to_string()
        };
        let duration = value.started.elapsed().as_secs_f64();
        self.latency
            .with_label_values(&[
                &driver,
                operation.as_str(),
                value.kind.as_str(),
                status.as_str(),
            ])
            .observe(duration);

        if operation == Operation::DeleteExport {
            for pending_op in [Operation::CreateExport, Operation::CreateExportAndReady] {
                let pending_key = OperationKey {
                    operation: pending_op,
                    resource_id: resource_id.to_string(),
                };
                if let Some(pending) = cache.remove(&pending_key) {
                    self.latency
                        .with_label_values(&[
                            &pending.driver,
                            pending_op.as_str(),
                            pending.kind.as_str(),
                            OperationStatus::Cancel.as_str(),
                        ])
                        .observe(duration);
                }
            }
        }

        self.in_flight.set(cache.len() as i64);
    }

    /// Number of tracked operations.
    pub fn in_flight(&self) -> usize {
        self.cache.lock().len()
    }

    /// Re-synchronize the in-flight gauge from the cache. The start/record
    /// paths maintain it too; this catches leaked entries.
    pub fn resync_in_flight_gauge(&self) {
        let cache = self.cache.lock();
        self.in_flight.set(cache.len() as i64);
    }

    /// Spawn the periodic gauge resync task.
    pub fn spawn_in_flight_resync(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IN_FLIGHT_CHECK_INTERVAL);
            loop {
                ticker.tick().await;
                metrics.resync_in_flight_gauge();
            }
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Gathered metric families, for tests.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

async fn metrics_handler(State(metrics): State<Arc<OperationMetrics>>) -> String {
    metrics.render()
}

/// Router exposing `GET /metrics`.
pub fn metrics_router(metrics: Arc<OperationMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Serve the metrics endpoint on the given address until the process exits.
pub async fn serve(metrics: Arc<OperationMetrics>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, metrics_router(metrics)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram_count(
        metrics: &OperationMetrics,
        operation: &str,
        status: &str,
    ) -> u64 {
        metrics
            .gather()
            .iter()
            .filter(|family| family.get_name().ends_with("operation_total_seconds"))
            .flat_map(|family| family.get_metric())
            .filter(|metric| {
                let labels: HashMap<_, _> = metric
                    .get_label()
                    .iter()
                    .map(|l| (l.get_name(), l.get_value()))
                    .collect();
                labels.get("operation_name") == Some(&operation)
                    && labels.get("operation_status") == Some(&status)
            })
            .map(|metric| metric.get_histogram().get_sample_count())
            .sum()
    }

    #[test]
    fn operation_start_is_idempotent() {
        let metrics = OperationMetrics::new();
        metrics.operation_start(Operation::CreateExport, "uid-1", "d", ExportKind::Dynamic);
        metrics.operation_start(Operation::CreateExport, "uid-1", "d", ExportKind::Dynamic);
        assert_eq!(metrics.in_flight(), 1);
    }

    #[test]
    fn record_without_start_is_a_noop() {
        let metrics = OperationMetrics::new();
        metrics.record_metrics(
            Operation::CreateExport,
            "uid-1",
            OperationStatus::Success,
            "d",
        );
        assert_eq!(histogram_count(&metrics, "CreateExport", "success"), 0);
    }

    #[test]
    fn record_observes_and_removes() {
        let metrics = OperationMetrics::new();
        metrics.operation_start(Operation::CreateExport, "uid-1", "d", ExportKind::Dynamic);
        metrics.record_metrics(
            Operation::CreateExport,
            "uid-1",
            OperationStatus::Success,
            "d",
        );
        assert_eq!(histogram_count(&metrics, "CreateExport", "success"), 1);
        assert_eq!(metrics.in_flight(), 0);
    }

    #[test]
    fn delete_cancels_pending_creates() {
        let metrics = OperationMetrics::new();
        metrics.operation_start(Operation::CreateExport, "uid-1", "d", ExportKind::Dynamic);
        metrics.operation_start(
            Operation::CreateExportAndReady,
            "uid-1",
            "d",
            ExportKind::Dynamic,
        );
        metrics.operation_start(Operation::DeleteExport, "uid-1", "d", ExportKind::Dynamic);

        metrics.record_metrics(
            Operation::DeleteExport,
            "uid-1",
            OperationStatus::Success,
            "d",
        );

        assert_eq!(histogram_count(&metrics, "DeleteExport", "success"), 1);
        assert_eq!(histogram_count(&metrics, "CreateExport", "cancel"), 1);
        assert_eq!(histogram_count(&metrics, "CreateExportAndReady", "cancel"), 1);
        assert_eq!(metrics.in_flight(), 0);
    }

    #[test]
    fn unknown_driver_falls_back_to_cached_value() {
        let metrics = OperationMetrics::new();
        metrics.operation_start(Operation::CreateExport, "uid-1", "real-driver", ExportKind::Dynamic);
        metrics.record_metrics(Operation::CreateExport, "uid-1", OperationStatus::Success, "");

        let found = metrics
            .gather()
            .iter()
            .filter(|f| f.get_name().ends_with("operation_total_seconds"))
            .flat_map(|f| f.get_metric())
            .any(|m| {
                m.get_label()
                    .iter()
                    .any(|l| l.get_name() == "driver_name" && l.get_value() == "real-driver")
            });
        assert!(found);
    }

    #[test]
    fn gauge_resync_matches_cache() {
        let metrics = OperationMetrics::new();
        metrics.operation_start(Operation::CreateExport, "uid-1", "d", ExportKind::Dynamic);
        metrics.resync_in_flight_gauge();
        let gauge = metrics
            .gather()
            .iter()
            .find(|f| f.get_name().ends_with("operations_in_flight"))
            .and_then(|f| f.get_metric().first().map(|m| m.get_gauge().get_value()))
            .unwrap_or_default();
        assert_eq!(gauge as i64, 1);
    }

    #[test]
    fn render_produces_text_exposition() {
        let metrics = OperationMetrics::new();
        metrics.operation_start(Operation::CreateExport, "uid-1", "d", ExportKind::Dynamic);
        let text = metrics.render();
        assert!(text.contains("export_controller_operations_in_flight"));
    }
}
