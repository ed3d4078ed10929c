use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

/// Prometheus metrics for the daemon connection pool. Optional: pools built
/// without metrics skip all accounting.
#[derive(Clone, Debug)]
pub struct ClientMetrics {
    /// Connections currently leased out.
    pub active_connections: IntGauge,
    /// Fresh connections waiting in the pool.
    pub idle_connections: IntGauge,
    /// Connections created, labeled by outcome ("success" or "error").
    pub connections_created: IntCounterVec,
    /// Connection-level failures, labeled by kind ("broken", "expired",
    /// "creation_failed").
    pub connection_errors: IntCounterVec,
}

impl ClientMetrics {
    pub fn new(prefix: &str, registry: &Registry) -> Result<Self, prometheus::Error> {
        let active_connections = IntGauge::with_opts(Opts::new(
            format!("{prefix}_daemon_active_connections"),
            "Number of daemon connections currently in use",
        ))?;

        let idle_connections = IntGauge::with_opts(Opts::new(
            format!("{prefix}_daemon_idle_connections"),
            "Number of idle daemon connections in the pool",
        ))?;

        let connections_created = IntCounterVec::new(
            Opts::new(
                format!("{prefix}_daemon_connections_created_total"),
                "Total daemon connections created",
            ),
            &["status"],
        )?;

        let connection_errors = IntCounterVec::new(
            Opts::new(
                format!("{prefix}_daemon_connection_errors_total"),
                "Total daemon connection errors",
            ),
            &["error_type"],
        )?;

        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(idle_connections.clone()))?;
        registry.register(Box::new(connections_created.clone()))?;
        registry.register(Box::new(connection_errors.clone()))?;

        Ok(ClientMetrics {
            active_connections,
            idle_connections,
            connections_created,
            connection_errors,
        })
    }
}
