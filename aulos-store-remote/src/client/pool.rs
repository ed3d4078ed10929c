//! The bounded connection pool.
//!
//! Invariant: `idle + in_use <= capacity`, capacity at least 1. The first
//! failure to open-and-greet a connection latches the pool as failed and
//! every later acquisition fails fast with `StoreUnreachable`.
//!
//! State lives under one std mutex (critical sections are tiny and never
//! cross an await); waiting for a returned connection goes through a
//! `Notify`. Capacity can be bumped transiently while a bulk upload holds
//! its lease so that a nested acquisition cannot deadlock a full pool.

use crate::client::connection::Connection;
use crate::client::metrics::ClientMetrics;
use crate::error::ProtocolError;
use crate::logger::ActivityLogger;
use crate::protocol::ProtocolVersion;
use crate::settings::ClientSettings;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, trace};

struct PoolState {
    idle: VecDeque<Connection>,
    in_use: usize,
    capacity: usize,
    failed: bool,
}

impl PoolState {
    fn invariant(&self) -> bool {
        self.idle.len() + self.in_use <= self.capacity && self.capacity > 0
    }

    fn update_metrics(&self, metrics: &Option<Arc<ClientMetrics>>) {
        if let Some(metrics) = metrics {
            metrics.idle_connections.set(self.idle.len() as i64);
            metrics.active_connections.set(self.in_use as i64);
        }
    }
}

/// Cheap to clone; clones share the same pool state.
#[derive(Clone)]
pub(crate) struct ConnectionPool {
    state: Arc<Mutex<PoolState>>,
    available: Arc<Notify>,
    settings: Arc<ClientSettings>,
    socket_path: PathBuf,
    uri: String,
    logger: Arc<dyn ActivityLogger>,
    metrics: Option<Arc<ClientMetrics>>,
}

impl ConnectionPool {
    pub(crate) fn new(
        settings: Arc<ClientSettings>,
        socket_path: PathBuf,
        uri: String,
        logger: Arc<dyn ActivityLogger>,
        metrics: Option<Arc<ClientMetrics>>,
    ) -> Self {
        let capacity = settings.max_connections.max(1);
        Self {
            state: Arc::new(Mutex::new(PoolState {
                idle: VecDeque::new(),
                in_use: 0,
                capacity,
                failed: false,
            })),
            available: Arc::new(Notify::new()),
            settings,
            socket_path,
            uri,
            logger,
            metrics,
        }
    }

    /// Lease a healthy fresh connection, opening one if allowed, blocking
    /// if the pool is at capacity with nothing idle.
    pub(crate) async fn get(&self) -> Result<PooledConnectionGuard, ProtocolError> {
        loop {
            let open_permitted = {
                let mut state = self.state.lock().unwrap();
                debug_assert!(state.invariant());

                if state.failed {
                    // Cascade the wakeup so every waiter observes the latch.
                    self.available.notify_one();
                    return Err(ProtocolError::StoreUnreachable {
                        uri: self.uri.clone(),
                    });
                }

                let max_age = self.settings.max_connection_age;
                while let Some(conn) = state.idle.pop_front() {
                    if conn.is_healthy(max_age) {
                        state.in_use += 1;
                        state.update_metrics(&self.metrics);
                        trace!("reusing idle daemon connection");
                        return Ok(PooledConnectionGuard::new(self.clone(), conn));
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .connection_errors
                            .with_label_values(&["expired"])
                            .inc();
                    }
                    discard(conn);
                }

                if state.in_use < state.capacity {
                    // Reserve the slot before the open so concurrent
                    // acquisitions cannot overshoot capacity.
                    state.in_use += 1;
                    state.update_metrics(&self.metrics);
                    true
                } else {
                    false
                }
            };

            if open_permitted {
                return match Connection::open(
                    &self.settings,
                    &self.socket_path,
                    self.logger.clone(),
                )
                .await
                {
                    Ok(conn) => {
                        if let Some(metrics) = &self.metrics {
                            metrics
                                .connections_created
                                .with_label_values(&["success"])
                                .inc();
                        }
                        debug!("opened daemon connection ({})", conn.version());
                        Ok(PooledConnectionGuard::new(self.clone(), conn))
                    }
                    Err(e) => {
                        {
                            let mut state = self.state.lock().unwrap();
                            state.in_use -= 1;
                            state.failed = true;
                            state.update_metrics(&self.metrics);
                        }
                        self.available.notify_one();
                        if let Some(metrics) = &self.metrics {
                            metrics
                                .connections_created
                                .with_label_values(&["error"])
                                .inc();
                            metrics
                                .connection_errors
                                .with_label_values(&["creation_failed"])
                                .inc();
                        }
                        Err(ProtocolError::Open {
                            uri: self.uri.clone(),
                            source: Box::new(e),
                        })
                    }
                };
            }

            trace!("daemon connection pool at capacity, waiting");
            self.available.notified().await;
        }
    }

    /// Drop idle connections that fail the health predicate.
    pub(crate) fn flush_bad(&self) {
        let mut state = self.state.lock().unwrap();
        let max_age = self.settings.max_connection_age;
        let mut kept = VecDeque::with_capacity(state.idle.len());
        while let Some(conn) = state.idle.pop_front() {
            if conn.is_healthy(max_age) {
                kept.push_back(conn);
            } else {
                discard(conn);
            }
        }
        state.idle = kept;
        state.update_metrics(&self.metrics);
    }

    /// Transiently allow one more connection. Paired with
    /// [`ConnectionPool::dec_capacity`]; used while a bulk upload holds a
    /// lease and may need a second one.
    pub(crate) fn inc_capacity(&self) {
        let mut state = self.state.lock().unwrap();
        state.capacity += 1;
        drop(state);
        self.available.notify_one();
    }

    pub(crate) fn dec_capacity(&self) {
        let mut state = self.state.lock().unwrap();
        state.capacity = state.capacity.saturating_sub(1).max(1);
        // Excess idle connections drain as leases come back.
    }

    /// `(idle, in_use, capacity)`, for tests and introspection.
    pub(crate) fn stats(&self) -> (usize, usize, usize) {
        let state = self.state.lock().unwrap();
        (state.idle.len(), state.in_use, state.capacity)
    }

    fn release(&self, conn: Option<Connection>) {
        let mut state = self.state.lock().unwrap();
        state.in_use -= 1;

        if let Some(conn) = conn {
            let healthy = conn.is_healthy(self.settings.max_connection_age);
            let room = state.idle.len() + state.in_use < state.capacity;
            if healthy && room && !state.failed {
                state.idle.push_back(conn);
            } else {
                discard(conn);
            }
        }

        debug_assert!(state.invariant());
        state.update_metrics(&self.metrics);
        drop(state);
        self.available.notify_one();
    }
}

/// Close a connection outside the pool lock, flushing its write buffer
/// best-effort first.
fn discard(conn: Connection) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(conn.shutdown());
    }
}

/// Scoped holder of one leased connection.
///
/// Dropping the guard returns the connection to the pool. Callers that
/// detect a desynchronized stream call [`PooledConnectionGuard::mark_broken`]
/// instead, which drops the connection on release. A clean daemon-reported
/// error is *not* a desynchronization; those connections go back idle.
pub(crate) struct PooledConnectionGuard {
    conn: Option<Connection>,
    pool: ConnectionPool,
}

impl PooledConnectionGuard {
    fn new(pool: ConnectionPool, conn: Connection) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    pub(crate) fn connection(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection leased")
    }

    pub(crate) fn version(&self) -> ProtocolVersion {
        self.conn.as_ref().expect("connection leased").version()
    }

    /// Consume the guard, ensuring the connection is dropped rather than
    /// recycled.
    pub(crate) fn mark_broken(mut self) {
        if let Some(conn) = self.conn.as_mut() {
            debug!("dropping daemon connection after protocol desynchronization");
            conn.mark_bad();
            if let Some(metrics) = &self.pool.metrics {
                metrics
                    .connection_errors
                    .with_label_values(&["broken"])
                    .inc();
            }
        }
        // The drop below releases the lease; an unhealthy connection is
        // discarded there instead of going back idle.
    }
}

impl Drop for PooledConnectionGuard {
    fn drop(&mut self) {
        self.pool.release(self.conn.take());
    }
}
