//! Component M: a per-endpoint pool of long-lived connections with
//! blacklisting and sibling-pool rotation.
//!
//! Generic over a `Connector` so the same pool/blacklist/rotation logic
//! serves the `FailOverCacheClient`'s TCP connections and any other
//! endpoint-addressed resource without duplicating the bookkeeping.

use crate::error::EngineErrorKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use snafu::Snafu;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Semaphore;

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum PoolError {
    #[snafu(display("endpoint {endpoint} is blacklisted"))]
    EndpointBlacklisted { endpoint: String },
    #[snafu(display("pool for {endpoint} exhausted after {timeout_ms}ms"))]
    PoolExhausted { endpoint: String, timeout_ms: u64 },
    #[snafu(display("no endpoint available: all are blacklisted"))]
    AllBlacklisted,
    #[snafu(display("failed to establish connection to {endpoint}: {message}"))]
    Connect { endpoint: String, message: String },
}

impl PoolError {
    pub fn kind(&self) -> EngineErrorKind {
        EngineErrorKind::FocUnreachable
    }
}

/// Anything the pool can open a fresh connection to and health-check.
#[async_trait]
pub trait Connector: Send + Sync {
    type Conn: Send;

    async fn connect(&self, endpoint: &str) -> Result<Self::Conn, String>;
}

struct EndpointState<C> {
    idle: Vec<C>,
    in_use: usize,
    blacklisted_until: Option<Instant>,
    error_count: u64,
}

impl<C> Default for EndpointState<C> {
    fn default() -> Self {
        Self {
            idle: vec![],
            in_use: 0,
            blacklisted_until: None,
            error_count: 0,
        }
    }
}

/// A connection on loan from the pool. Dropping it without calling
/// `release`/`discard` returns it to the idle set automatically (the
/// common case: the caller used it successfully and just goes out of
/// scope).
pub struct PooledConn<C> {
    endpoint: String,
    conn: Option<C>,
    pool: Arc<PoolInner<C>>,
}

impl<C> PooledConn<C> {
    pub fn get_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("conn taken only on drop/discard")
    }

    /// The connection errored during use; drop it instead of returning it
    /// to the idle set.
    pub fn discard(mut self) {
        self.conn = None;
        self.pool.on_release(&self.endpoint, None);
    }
}

impl<C> Drop for PooledConn<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.on_release(&self.endpoint, Some(conn));
        }
    }
}

struct PoolInner<C> {
    states: Mutex<HashMap<String, EndpointState<C>>>,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    max_conns_per_endpoint: usize,
    acquire_timeout: Duration,
}

impl<C> PoolInner<C> {
    fn on_release(&self, endpoint: &str, conn: Option<C>) {
        let mut states = self.states.lock();
        let state = states.entry(endpoint.to_string()).or_default();
        state.in_use = state.in_use.saturating_sub(1);
        match conn {
            Some(c) => state.idle.push(c),
            None => state.error_count += 1,
        }
    }

    fn semaphore(&self, endpoint: &str) -> Arc<Semaphore> {
        self.semaphores
            .lock()
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_conns_per_endpoint)))
            .clone()
    }
}

/// `ConnectionPool<C>`: `C` is a `Connector` supplying fresh connections
/// on demand; the pool owns sizing, blacklisting and idle reuse.
pub struct ConnectionPool<C: Connector> {
    connector: C,
    inner: Arc<PoolInner<C::Conn>>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, max_conns_per_endpoint: usize, acquire_timeout: Duration) -> Self {
        Self {
            connector,
            inner: Arc::new(PoolInner {
                states: Mutex::new(HashMap::new()),
                semaphores: Mutex::new(HashMap::new()),
                max_conns_per_endpoint,
                acquire_timeout,
            }),
        }
    }

    fn is_blacklisted(&self, endpoint: &str) -> bool {
        let mut states = self.inner.states.lock();
        let state = states.entry(endpoint.to_string()).or_default();
        match state.blacklisted_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Expired: allow exactly one probing connection through by
                // clearing the mark; sizing resumes normally after that.
                state.blacklisted_until = None;
                false
            }
            None => false,
        }
    }

    pub fn blacklist(&self, endpoint: &str, for_duration: Duration) {
        let mut states = self.inner.states.lock();
        states.entry(endpoint.to_string()).or_default().blacklisted_until =
            Some(Instant::now() + for_duration);
    }

    pub async fn acquire(
        &self,
        endpoint: &str,
    ) -> Result<PooledConn<C::Conn>, PoolError> {
        if self.is_blacklisted(endpoint) {
            return Err(PoolError::EndpointBlacklisted {
                endpoint: endpoint.to_string(),
            });
        }

        if let Some(conn) = {
            let mut states = self.inner.states.lock();
            states.entry(endpoint.to_string()).or_default().idle.pop()
        } {
            self.inner.states.lock().entry(endpoint.to_string()).or_default().in_use += 1;
            return Ok(PooledConn {
                endpoint: endpoint.to_string(),
                conn: Some(conn),
                pool: self.inner.clone(),
            });
        }

        let sem = self.inner.semaphore(endpoint);
        let permit = tokio::time::timeout(self.inner.acquire_timeout, sem.acquire_owned())
            .await
            .map_err(|_| PoolError::PoolExhausted {
                endpoint: endpoint.to_string(),
                timeout_ms: self.inner.acquire_timeout.as_millis() as u64,
            })?
            .expect("semaphore never closed");
        permit.forget(); // connection lifetime, not permit lifetime, bounds concurrency

        let conn = self
            .connector
            .connect(endpoint)
            .await
            .map_err(|message| PoolError::Connect {
                endpoint: endpoint.to_string(),
                message,
            })?;
        self.inner.states.lock().entry(endpoint.to_string()).or_default().in_use += 1;
        Ok(PooledConn {
            endpoint: endpoint.to_string(),
            conn: Some(conn),
            pool: self.inner.clone(),
        })
    }

    /// Tries each endpoint in turn; if every one is blacklisted, forces a
    /// retry against a uniformly-random endpoint rather than failing
    /// outright (the blacklist exists to avoid wasted attempts, not to
    /// leave every sibling permanently unreachable).
    pub async fn acquire_any(
        &self,
        endpoints: &[String],
    ) -> Result<PooledConn<C::Conn>, PoolError> {
        for endpoint in endpoints {
            if !self.is_blacklisted(endpoint) {
                return self.acquire(endpoint).await;
            }
        }
        let endpoint = endpoints
            .choose(&mut rand::thread_rng())
            .ok_or(PoolError::AllBlacklisted)?;
        self.acquire_forced(endpoint).await
    }

    /// Like `acquire`, but bypasses the blacklist check — used only by
    /// `acquire_any`'s last-resort retry.
    async fn acquire_forced(
        &self,
        endpoint: &str,
    ) -> Result<PooledConn<C::Conn>, PoolError> {
        self.inner.states.lock().entry(endpoint.to_string()).or_default().blacklisted_until = None;
        self.acquire(endpoint).await
    }

    pub fn metrics(&self, endpoint: &str) -> PoolMetrics {
        let mut states = self.inner.states.lock();
        let state = states.entry(endpoint.to_string()).or_default();
        PoolMetrics {
            idle: state.idle.len(),
            in_use: state.in_use,
            blacklisted: state.blacklisted_until.is_some(),
            error_count: state.error_count,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolMetrics {
    pub idle: usize,
    pub in_use: usize,
    pub blacklisted: bool,
    pub error_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConnector {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        type Conn = usize;

        async fn connect(&self, _endpoint: &str) -> Result<usize, String> {
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let pool = ConnectionPool::new(
            CountingConnector { opened: AtomicUsize::new(0) },
            2,
            Duration::from_millis(100),
        );
        let conn = pool.acquire("ep0").await.unwrap();
        drop(conn);
        let _conn2 = pool.acquire("ep0").await.unwrap();
        let metrics = pool.metrics("ep0");
        assert_eq!(metrics.in_use, 1);
        assert_eq!(metrics.idle, 0);
    }

    #[tokio::test]
    async fn blacklisted_endpoint_fails_fast() {
        let pool = ConnectionPool::new(
            CountingConnector { opened: AtomicUsize::new(0) },
            2,
            Duration::from_millis(100),
        );
        pool.blacklist("ep0", Duration::from_secs(60));
        let err = pool.acquire("ep0").await.unwrap_err();
        assert!(matches!(err, PoolError::EndpointBlacklisted { .. }));
    }

    #[tokio::test]
    async fn acquire_any_falls_back_to_random_when_all_blacklisted() {
        let pool = ConnectionPool::new(
            CountingConnector { opened: AtomicUsize::new(0) },
            2,
            Duration::from_millis(100),
        );
        pool.blacklist("ep0", Duration::from_secs(60));
        pool.blacklist("ep1", Duration::from_secs(60));
        let endpoints = vec!["ep0".to_string(), "ep1".to_string()];
        // Both blacklisted, but acquire_any forces a retry rather than
        // failing outright.
        pool.acquire_any(&endpoints).await.unwrap();
    }
}
