//! Per-provider connection pool
//!
//! A bounded set of long-lived [`NntpConnection`]s for one provider.
//! Capacity is enforced by a FIFO-fair semaphore, so waiters are served in
//! arrival order and a cancelled waiter simply leaves the queue. Idle
//! connections past the configured idle threshold are pinged with `DATE`
//! before reuse; connections that fail the ping, or come back broken, are
//! discarded and replaced on demand. Opening a replacement goes through
//! the transient-failure backoff, so a provider that is briefly down is
//! not hammered by every waiting lease at once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::config::{ConnectionsConfig, ProviderConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::retry::retry_transient;

use super::connection::NntpConnection;

/// Bounded pool of connections to a single provider
#[derive(Clone)]
pub struct ProviderPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    provider: ProviderConfig,
    semaphore: Arc<Semaphore>,
    idle: std::sync::Mutex<VecDeque<NntpConnection>>,
    operation_timeout: Duration,
    acquire_timeout: Duration,
    idle_ping_after: Duration,
    stream_buffer_size: usize,
    retry: RetryConfig,
}

impl ProviderPool {
    /// Create a pool for one provider
    pub fn new(
        provider: ProviderConfig,
        connections: &ConnectionsConfig,
        retry: RetryConfig,
    ) -> Self {
        let max = provider.max_connections.max(1);
        Self {
            inner: Arc::new(PoolInner {
                provider,
                semaphore: Arc::new(Semaphore::new(max)),
                idle: std::sync::Mutex::new(VecDeque::new()),
                operation_timeout: connections.operation_timeout(),
                acquire_timeout: connections.acquire_timeout(),
                idle_ping_after: Duration::from_secs(connections.idle_ping_after_secs),
                stream_buffer_size: connections.stream_buffer_size,
                retry,
            }),
        }
    }

    /// Provider this pool serves
    pub fn provider(&self) -> &ProviderConfig {
        &self.inner.provider
    }

    /// Lease a connection, waiting FIFO-fair up to the acquisition timeout
    ///
    /// Dropping the returned lease gives the connection back; a broken
    /// connection is closed instead and its slot opens for a fresh one.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = timeout(
            self.inner.acquire_timeout,
            self.inner.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| Error::Timeout {
            seconds: self.inner.acquire_timeout.as_secs(),
        })?
        .map_err(|_| Error::Cancelled)?;

        // Prefer a pooled connection; ping stale ones before trusting them
        while let Some(mut conn) = self.pop_idle() {
            if !conn.is_healthy() {
                continue;
            }
            if conn.idle_for() >= self.inner.idle_ping_after {
                if conn.date().await.is_err() {
                    tracing::debug!(host = %self.inner.provider.host, "discarding connection that failed idle ping");
                    continue;
                }
            }
            return Ok(PooledConnection {
                conn: Some(conn),
                inner: self.inner.clone(),
                permit: Some(permit),
            });
        }

        // Nothing pooled; open a fresh connection, backing off through
        // transient connect failures (permit is released on error)
        let provider = &self.inner.provider;
        let operation_timeout = self.inner.operation_timeout;
        let buffer_size = self.inner.stream_buffer_size;
        let conn = retry_transient(&self.inner.retry, "nntp connect", || {
            NntpConnection::connect(provider, operation_timeout, buffer_size)
        })
        .await?;

        Ok(PooledConnection {
            conn: Some(conn),
            inner: self.inner.clone(),
            permit: Some(permit),
        })
    }

    /// Permits currently available (capacity minus leased)
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Pool capacity
    pub fn capacity(&self) -> usize {
        self.inner.provider.max_connections.max(1)
    }

    /// Close all idle connections politely
    pub async fn close(&self) {
        let drained: Vec<NntpConnection> = {
            let mut idle = self.inner.idle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            idle.drain(..).collect()
        };
        for mut conn in drained {
            conn.quit().await;
        }
    }

    fn pop_idle(&self) -> Option<NntpConnection> {
        self.inner.idle.lock().unwrap_or_else(std::sync::PoisonError::into_inner).pop_front()
    }
}

impl PoolInner {
    /// Settle a returned connection: finish any pending transfer, then pool
    /// it or drop it
    async fn give_back(self: Arc<Self>, mut conn: NntpConnection) {
        let settled = conn.reclaim().await;
        if settled.is_ok() && conn.is_healthy() {
            self.idle
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push_back(conn);
        } else {
            tracing::debug!(host = %self.provider.host, "dropping broken connection on return");
        }
    }
}

/// RAII lease on one pooled connection
///
/// Derefs to [`NntpConnection`]. On drop the connection settles back into
/// the pool asynchronously; the capacity permit is released only once the
/// connection has actually been returned or discarded.
pub struct PooledConnection {
    conn: Option<NntpConnection>,
    inner: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::ops::Deref for PooledConnection {
    type Target = NntpConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("lease already released")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("lease already released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let permit = self.permit.take();
        let inner = self.inner.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    inner.give_back(conn).await;
                    drop(permit);
                });
            }
            // No runtime (process teardown): drop the socket outright
            Err(_) => drop(permit),
        }
    }
}
