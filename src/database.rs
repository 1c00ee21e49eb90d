use crate::{
    dialect::CurrentArguments,
    query::sql::{SqlQuery, SqlValue},
};
pub use crate::dialect::{CurrentRow, Db};
pub use sqlx::Pool;
use sqlx::{Arguments, FromRow};
use thiserror::Error;
use tracing::debug;

/// A handle to the data source queried by [`SqlQuery`].
///
/// This struct wraps an SQLx connection pool. Queries built from it stay lazy until
/// they are fetched or counted; every execution goes through the retry policy here.
#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Db>,
}

impl Database {
    pub fn new(pool: Pool<Db>) -> Self {
        Self { pool }
    }

    /// Connects a new pool to `url`.
    pub async fn connect(url: &str) -> Result<Self, DatabaseError> {
        let pool = Pool::connect(url)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed { source: e })?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool<Db> {
        &self.pool
    }

    /// Starts a lazy query over every row of `table`, decoded as `R`.
    pub fn table<R>(&self, table: &str) -> SqlQuery<R>
    where
        R: for<'r> FromRow<'r, CurrentRow> + Send + Unpin + 'static,
    {
        SqlQuery::new(self.clone(), table, |row: &CurrentRow| R::from_row(row))
    }

    /// Executes a script of one or more statements. Not retried.
    pub async fn execute(&self, sql: &str) -> Result<u64, DatabaseError> {
        let result = sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryFailed {
                operation: DbOperation::Execute,
                sql: sql.to_string(),
                source: e,
            })?;

        Ok(result.rows_affected())
    }

    async fn retry<F, Fut, T>(&self, mut op: F) -> Result<T, DatabaseError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, DatabaseError>>,
    {
        let max_retries = 3;
        for attempt in 0..max_retries {
            let result = op().await;
            match result {
                Ok(v) => return Ok(v),
                Err(ref e) if e.is_retryable() && attempt + 1 < max_retries => {
                    debug!(attempt, error = %e, "retrying query");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        unreachable!("Retry loop should return before exceeding max_retries")
    }

    /// Runs a `SELECT` and returns the raw rows.
    pub(crate) async fn fetch_rows(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<CurrentRow>, DatabaseError> {
        self.retry(|| async {
            let arguments = bind_params(params).map_err(|e| DatabaseError::QueryFailed {
                operation: DbOperation::Fetch,
                sql: sql.to_string(),
                source: e,
            })?;

            sqlx::query_with(sql, arguments)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::Fetch,
                    sql: sql.to_string(),
                    source: e,
                })
        })
        .await
    }

    /// Runs a single-value `COUNT` statement.
    pub(crate) async fn fetch_count(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<u64, DatabaseError> {
        let count: i64 = self
            .retry(|| async {
                let arguments = bind_params(params).map_err(|e| DatabaseError::QueryFailed {
                    operation: DbOperation::Count,
                    sql: sql.to_string(),
                    source: e,
                })?;

                sqlx::query_scalar_with(sql, arguments)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| DatabaseError::QueryFailed {
                        operation: DbOperation::Count,
                        sql: sql.to_string(),
                        source: e,
                    })
            })
            .await?;

        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn bind_params<'q>(params: &[SqlValue]) -> Result<CurrentArguments<'q>, sqlx::Error> {
    let mut arguments = CurrentArguments::default();

    for param in params {
        let added = match param {
            SqlValue::Null => arguments.add(Option::<i64>::None),
            SqlValue::Integer(v) => arguments.add(*v),
            SqlValue::Real(v) => arguments.add(*v),
            SqlValue::Text(v) => arguments.add(v.clone()),
            SqlValue::Bool(v) => arguments.add(*v),
        };
        added.map_err(sqlx::Error::Encode)?;
    }

    Ok(arguments)
}

/// Represents errors that can occur while executing a query against the database.
///
/// Each variant includes contextual information to assist with debugging and error handling.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A general SQL query failure, with the operation and rendered SQL.
    #[error("Query failed during {operation:?}: sql={sql}")]
    QueryFailed {
        operation: DbOperation,
        sql: String,
        #[source]
        source: sqlx::Error,
    },

    /// A row came back that the query's decoder could not read.
    #[error("Failed to decode row")]
    Decode {
        #[source]
        source: sqlx::Error,
    },

    /// The pool could not be opened.
    #[error("Failed to connect to database")]
    ConnectionFailed {
        #[source]
        source: sqlx::Error,
    },
}

/// The kind of database operation being performed,
/// used for attaching context to [`DatabaseError::QueryFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbOperation {
    /// SELECT of a page or a full query
    Fetch,
    /// SELECT COUNT(*) over a query
    Count,
    /// Raw statements
    Execute,
}

impl DatabaseError {
    fn is_retryable(&self) -> bool {
        let is_retryable_kind = |e: &sqlx::Error| {
            matches!(e, sqlx::Error::Io(_))
                || matches!(e, sqlx::Error::Protocol(_))
                || matches!(e, sqlx::Error::PoolTimedOut)
        };

        match self {
            DatabaseError::QueryFailed {
                sql: _,
                source,
                operation: _,
            } => is_retryable_kind(source),
            DatabaseError::Decode { .. } => false,
            DatabaseError::ConnectionFailed { source } => is_retryable_kind(source),
        }
    }
}
