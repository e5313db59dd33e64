//! Prometheus metrics for the gateway
//!
//! Exposes metrics via HTTP endpoint for Prometheus scraping.

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Gateway metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Connection metrics, labelled by side (front/back)
    pub connections_total: IntCounterVec,
    pub connections_active: IntGaugeVec,
    pub connections_closed: IntCounterVec,

    // Traffic metrics
    pub bytes_received_total: IntCounter,
    pub bytes_sent_total: IntCounter,
    pub commands_total: IntCounterVec,
    pub auth_failures_total: IntCounterVec,

    // Backend metrics
    /// Heartbeat probe results by data source and status
    pub heartbeat_total: IntCounterVec,
    /// Connections checked out of each data source
    pub pool_active_connections: IntGaugeVec,

    /// Bytes currently handed out by the buffer pool
    pub buffer_allocated_bytes: IntGauge,
}

impl Metrics {
    /// Create a new metrics collection
    ///
    /// Metric names and label sets are static, so construction cannot fail
    /// at runtime.
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounterVec::new(
            Opts::new("athena_connections_total", "Total number of connections opened"),
            &["side"],
        )
        .unwrap();

        let connections_active = IntGaugeVec::new(
            Opts::new("athena_connections_active", "Current number of open connections"),
            &["side"],
        )
        .unwrap();

        let connections_closed = IntCounterVec::new(
            Opts::new("athena_connections_closed_total", "Total number of connections closed"),
            &["side"],
        )
        .unwrap();

        let bytes_received_total = IntCounter::new(
            "athena_bytes_received_total",
            "Total bytes read from client connections",
        )
        .unwrap();

        let bytes_sent_total = IntCounter::new(
            "athena_bytes_sent_total",
            "Total bytes written to client connections",
        )
        .unwrap();

        let commands_total = IntCounterVec::new(
            Opts::new("athena_commands_total", "Total number of client commands"),
            &["command"], // query, ping, init_db, quit, ...
        )
        .unwrap();

        let auth_failures_total = IntCounterVec::new(
            Opts::new("athena_auth_failures_total", "Total number of rejected logins"),
            &["reason"],
        )
        .unwrap();

        let heartbeat_total = IntCounterVec::new(
            Opts::new("athena_heartbeat_total", "Total number of heartbeat probes by result"),
            &["datasource", "status"], // ok, error, timeout
        )
        .unwrap();

        let pool_active_connections = IntGaugeVec::new(
            Opts::new(
                "athena_pool_active_connections",
                "Backend connections currently borrowed from a data source",
            ),
            &["datasource"],
        )
        .unwrap();

        let buffer_allocated_bytes = IntGauge::new(
            "athena_buffer_allocated_bytes",
            "Bytes currently allocated from the buffer pool",
        )
        .unwrap();

        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_closed.clone()))
            .unwrap();
        registry
            .register(Box::new(bytes_received_total.clone()))
            .unwrap();
        registry
            .register(Box::new(bytes_sent_total.clone()))
            .unwrap();
        registry
            .register(Box::new(commands_total.clone()))
            .unwrap();
        registry
            .register(Box::new(auth_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(heartbeat_total.clone()))
            .unwrap();
        registry
            .register(Box::new(pool_active_connections.clone()))
            .unwrap();
        registry
            .register(Box::new(buffer_allocated_bytes.clone()))
            .unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            bytes_received_total,
            bytes_sent_total,
            commands_total,
            auth_failures_total,
            heartbeat_total,
            pool_active_connections,
            buffer_allocated_bytes,
        }
    }

    /// Record a newly registered connection
    pub fn record_connection_opened(&self, side: &str) {
        self.connections_total.with_label_values(&[side]).inc();
        self.connections_active.with_label_values(&[side]).inc();
    }

    /// Record a connection closed
    pub fn record_connection_closed(&self, side: &str) {
        self.connections_active.with_label_values(&[side]).dec();
        self.connections_closed.with_label_values(&[side]).inc();
    }

    pub fn record_command(&self, command: &str) {
        self.commands_total.with_label_values(&[command]).inc();
    }

    pub fn record_auth_failure(&self, reason: &str) {
        self.auth_failures_total.with_label_values(&[reason]).inc();
    }

    /// Record a heartbeat probe result
    pub fn record_heartbeat(&self, datasource: &str, status: &str) {
        self.heartbeat_total
            .with_label_values(&[datasource, status])
            .inc();
    }

    pub fn set_pool_active(&self, datasource: &str, active: usize) {
        self.pool_active_connections
            .with_label_values(&[datasource])
            .set(active as i64);
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    fn respond(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        if let Ok(value) = content_type.parse() {
            response.headers_mut().insert("Content-Type", value);
        }
        response
    }

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        Ok(match req.uri().path() {
            "/metrics" => respond(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                metrics().gather(),
            ),
            "/health" => respond(StatusCode::OK, "text/plain", "OK".to_string()),
            _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
        })
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
