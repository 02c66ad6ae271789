//! Self-healing MySQL connection pool.
//!
//! Wraps `mysql_async::Pool` with retry-with-backoff semantics: errors that
//! look like lost connections tear the pool down and open a fresh one before
//! the next attempt; everything else just backs off. The current pool handle
//! sits behind a read-write lock so reads stay cheap while a reconnect holds
//! the writer side.

use std::future::Future;
use std::time::Duration;

use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::RetryConfig;

/// Error substrings that identify a dead or unusable connection.
const CONNECTION_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "broken pipe",
    "no such host",
    "network is unreachable",
    "connection timed out",
    "driver: bad connection",
    "invalid connection",
    "server has gone away",
    "connection lost",
];

/// Errors surfaced by [`DbPool`].
#[derive(Error, Debug)]
pub enum DbError {
    #[error("database is not open")]
    NotOpen,

    #[error("operation failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<DbError>,
    },

    #[error(transparent)]
    Driver(#[from] mysql_async::Error),

    #[error(transparent)]
    Url(#[from] mysql_async::UrlError),

    #[error("opening database timed out after {0:?}")]
    OpenTimeout(Duration),
}

/// True when the error message matches a known connection-failure pattern.
pub fn is_connection_error(err: &mysql_async::Error) -> bool {
    let msg = err.to_string();
    CONNECTION_ERRORS.iter().any(|pat| msg.contains(pat))
}

/// Resilient pool handle; cheap to share behind an `Arc`.
pub struct DbPool {
    dsn: String,
    concurrency: usize,
    retry: RetryConfig,
    pool: RwLock<Option<Pool>>,
}

impl DbPool {
    pub fn new(dsn: impl Into<String>, concurrency: usize, retry: RetryConfig) -> Self {
        Self {
            dsn: dsn.into(),
            concurrency: concurrency.max(1),
            retry,
            pool: RwLock::new(None),
        }
    }

    /// Opens the pool and verifies connectivity with a ping, optionally
    /// bounded by a wall-clock deadline.
    pub async fn open(&self, deadline: Option<Duration>) -> Result<(), DbError> {
        match deadline {
            Some(limit) => tokio::time::timeout(limit, self.connect())
                .await
                .map_err(|_| DbError::OpenTimeout(limit))?,
            None => self.connect().await,
        }
    }

    async fn connect(&self) -> Result<(), DbError> {
        let opts = Opts::from_url(&self.dsn)?;
        let min = (self.concurrency / 2).max(1);
        let constraints =
            PoolConstraints::new(min, self.concurrency).unwrap_or_default();
        let opts = OptsBuilder::from_opts(opts)
            .pool_opts(PoolOpts::default().with_constraints(constraints));

        let pool = Pool::new(opts);
        let mut conn = pool.get_conn().await?;
        conn.ping().await?;
        drop(conn);

        let old = { self.pool.write().replace(pool) };
        if let Some(old) = old {
            let _ = old.disconnect().await;
        }

        Ok(())
    }

    async fn reconnect(&self) -> Result<(), DbError> {
        info!("reconnecting to database");
        self.connect().await
    }

    /// Closes the pool.
    pub async fn close(&self) {
        let pool = { self.pool.write().take() };
        if let Some(pool) = pool {
            let _ = pool.disconnect().await;
        }
    }

    fn current(&self) -> Result<Pool, DbError> {
        self.pool.read().clone().ok_or(DbError::NotOpen)
    }

    /// Runs `op` with up to `max_retries + 1` attempts.
    ///
    /// Connection-class failures rebuild the pool before the next attempt;
    /// every attempt after the first waits `delay`, which grows by
    /// `backoff_factor` up to `max_delay`. The final failure is wrapped
    /// with the attempt count.
    pub async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, DbError>
    where
        F: FnMut(Pool) -> Fut,
        Fut: Future<Output = Result<T, mysql_async::Error>>,
    {
        let mut delay = self.retry.initial_delay;
        let mut last_err = DbError::NotOpen;

        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                let next = delay.as_secs_f64() * self.retry.backoff_factor;
                delay = Duration::from_secs_f64(next.min(self.retry.max_delay.as_secs_f64()));
            }

            let pool = match self.current() {
                Ok(pool) => pool,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };

            if self.retry.connection_check {
                let health = async {
                    let mut conn = pool.get_conn().await?;
                    conn.ping().await
                };
                if let Err(e) = health.await {
                    warn!(error = %e, attempt, "connection health check failed");
                    if is_connection_error(&e) {
                        if let Err(re) = self.reconnect().await {
                            warn!(error = %re, "reconnection failed");
                        }
                    }
                    last_err = DbError::Driver(e);
                    continue;
                }
            }

            match op(pool).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if is_connection_error(&e) {
                        if let Err(re) = self.reconnect().await {
                            warn!(error = %re, "reconnection failed");
                        }
                    }
                    last_err = DbError::Driver(e);
                }
            }
        }

        Err(DbError::RetriesExhausted {
            attempts: self.retry.max_retries + 1,
            source: Box::new(last_err),
        })
    }

    /// Executes a text-protocol statement, discarding any result set.
    pub async fn exec_text(&self, sql: &str) -> Result<(), DbError> {
        self.with_retry(|pool| {
            let sql = sql.to_owned();
            async move {
                let mut conn = pool.get_conn().await?;
                conn.query_drop(sql).await
            }
        })
        .await
    }

    /// Prepares and executes a parameterized statement. The prepared
    /// statement is cached per connection by the driver.
    pub async fn exec_prepared(
        &self,
        sql: &str,
        params: mysql_async::Params,
    ) -> Result<(), DbError> {
        self.with_retry(|pool| {
            let sql = sql.to_owned();
            let params = params.clone();
            async move {
                let mut conn = pool.get_conn().await?;
                conn.exec_drop(sql, params).await
            }
        })
        .await
    }

    /// Runs a query and collects every row into `T`.
    pub async fn query_rows<T>(&self, sql: &str) -> Result<Vec<T>, DbError>
    where
        T: FromRow + Send + 'static,
    {
        self.with_retry(|pool| {
            let sql = sql.to_owned();
            async move {
                let mut conn = pool.get_conn().await?;
                conn.query(sql).await
            }
        })
        .await
    }

    /// Runs a query expected to return at most one row.
    pub async fn query_first_row<T>(&self, sql: &str) -> Result<Option<T>, DbError>
    where
        T: FromRow + Send + 'static,
    {
        self.with_retry(|pool| {
            let sql = sql.to_owned();
            async move {
                let mut conn = pool.get_conn().await?;
                conn.query_first(sql).await
            }
        })
        .await
    }

    /// Verifies connectivity.
    pub async fn ping(&self) -> Result<(), DbError> {
        self.with_retry(|pool| async move {
            let mut conn = pool.get_conn().await?;
            conn.ping().await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_factor: 2.0,
            connection_check: false,
        }
    }

    fn pool_with_lazy_handle(max_retries: u32) -> DbPool {
        // Pool::new is lazy: no connection happens until get_conn, so a
        // bogus target works for exercising the retry loop.
        let db = DbPool::new("mysql://nobody@127.0.0.1:9/none", 2, fast_retry(max_retries));
        let opts = Opts::from_url("mysql://nobody@127.0.0.1:9/none").unwrap();
        *db.pool.write() = Some(Pool::new(opts));
        db
    }

    fn other_error(msg: &str) -> mysql_async::Error {
        mysql_async::Error::Other(msg.to_string().into())
    }

    #[test]
    fn test_connection_error_matching() {
        assert!(is_connection_error(&other_error(
            "driver: bad connection while writing"
        )));
        assert!(is_connection_error(&other_error(
            "MySQL server has gone away"
        )));
        assert!(is_connection_error(&other_error("connect: broken pipe")));
        assert!(!is_connection_error(&other_error(
            "Duplicate entry '1' for key 'PRIMARY'"
        )));
    }

    #[tokio::test]
    async fn test_retry_cap_for_persistent_error() {
        let db = pool_with_lazy_handle(3);
        let calls = AtomicU32::new(0);

        let result: Result<(), DbError> = db
            .with_retry(|_pool| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(other_error("syntax error near 'FROM'")) }
            })
            .await;

        // max_retries + 1 invocations, error wrapped with the count.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result.unwrap_err() {
            DbError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_transient_connection_error_recovers() {
        let db = pool_with_lazy_handle(3);
        let calls = AtomicU32::new(0);

        let result = db
            .with_retry(|_pool| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(other_error("driver: bad connection"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        // Two failures then success: exactly three invocations.
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unopened_pool_reports_not_open() {
        let db = DbPool::new("mysql://nobody@127.0.0.1:9/none", 1, fast_retry(0));

        let result: Result<(), DbError> = db.with_retry(|_pool| async { Ok(()) }).await;

        match result.unwrap_err() {
            DbError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 1);
                assert!(matches!(*source, DbError::NotOpen));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
