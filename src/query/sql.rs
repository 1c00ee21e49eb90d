//! SQL query engine.
//!
//! [`SqlQuery`] accumulates clauses and renders them into a single `SELECT`
//! statement through the current [`Dialect`]. Nothing is sent to the database
//! until [`LazyQuery::fetch`] or [`LazyQuery::count`] is awaited.

use super::{LazyQuery, Select, SortOrder};
use crate::{
    database::{CurrentRow, Database, DatabaseError},
    dialect::{CurrentDialect, Dialect},
};
use sqlx::FromRow;
use std::{fmt, sync::Arc};
use tracing::debug;

/// A typed value bound to a statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Integer(value.into())
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        SqlValue::Integer(value.into())
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

/// A possibly qualified column name such as `year` or `books.year`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Column(String);

impl Column {
    pub fn new<T: Into<String>>(name: T) -> Self {
        Column(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    fn to_sql(&self) -> String {
        CurrentDialect::quote_identifier(&self.0)
    }

    pub fn eq<V: Into<SqlValue>>(self, value: V) -> SqlExpr {
        SqlExpr::Eq(self, value.into())
    }

    pub fn ne<V: Into<SqlValue>>(self, value: V) -> SqlExpr {
        SqlExpr::Ne(self, value.into())
    }

    pub fn lt<V: Into<SqlValue>>(self, value: V) -> SqlExpr {
        SqlExpr::Lt(self, value.into())
    }

    pub fn le<V: Into<SqlValue>>(self, value: V) -> SqlExpr {
        SqlExpr::Le(self, value.into())
    }

    pub fn gt<V: Into<SqlValue>>(self, value: V) -> SqlExpr {
        SqlExpr::Gt(self, value.into())
    }

    pub fn ge<V: Into<SqlValue>>(self, value: V) -> SqlExpr {
        SqlExpr::Ge(self, value.into())
    }

    /// Matches a `LIKE` pattern; `%` and `_` keep their SQL meaning.
    pub fn like<T: Into<String>>(self, pattern: T) -> SqlExpr {
        SqlExpr::Like(self, pattern.into())
    }

    pub fn is_null(self) -> SqlExpr {
        SqlExpr::IsNull(self)
    }
}

impl From<&str> for Column {
    fn from(value: &str) -> Self {
        Column::new(value)
    }
}

impl From<String> for Column {
    fn from(value: String) -> Self {
        Column(value)
    }
}

/// Represents a boolean condition over the columns of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    Eq(Column, SqlValue),
    Ne(Column, SqlValue),
    Lt(Column, SqlValue),
    Le(Column, SqlValue),
    Gt(Column, SqlValue),
    Ge(Column, SqlValue),
    Like(Column, String),
    IsNull(Column),

    /// Logical AND of two expressions.
    And(Box<SqlExpr>, Box<SqlExpr>),

    /// Logical OR of two expressions.
    Or(Box<SqlExpr>, Box<SqlExpr>),

    /// Logical NOT of an expression.
    Not(Box<SqlExpr>),
}

impl SqlExpr {
    /// Combines two expressions with AND.
    pub fn and(self, other: SqlExpr) -> Self {
        SqlExpr::And(Box::new(self), Box::new(other))
    }

    /// Combines two expressions with OR.
    pub fn or(self, other: SqlExpr) -> Self {
        SqlExpr::Or(Box::new(self), Box::new(other))
    }

    pub fn not(expr: SqlExpr) -> Self {
        SqlExpr::Not(Box::new(expr))
    }

    /// Converts the expression into an SQL fragment and its bound parameters.
    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();
        let sql = self.build_sql(&mut params);
        (sql, params)
    }

    fn build_sql(&self, params: &mut Vec<SqlValue>) -> String {
        match self {
            SqlExpr::Eq(column, value) => compare(column, "=", value, params),
            SqlExpr::Ne(column, value) => compare(column, "<>", value, params),
            SqlExpr::Lt(column, value) => compare(column, "<", value, params),
            SqlExpr::Le(column, value) => compare(column, "<=", value, params),
            SqlExpr::Gt(column, value) => compare(column, ">", value, params),
            SqlExpr::Ge(column, value) => compare(column, ">=", value, params),
            SqlExpr::Like(column, pattern) => {
                compare(column, "LIKE", &SqlValue::Text(pattern.clone()), params)
            }
            SqlExpr::IsNull(column) => format!("{} IS NULL", column.to_sql()),
            SqlExpr::And(lhs, rhs) => {
                format!("({} AND {})", lhs.build_sql(params), rhs.build_sql(params))
            }
            SqlExpr::Or(lhs, rhs) => {
                format!("({} OR {})", lhs.build_sql(params), rhs.build_sql(params))
            }
            SqlExpr::Not(expr) => format!("NOT ({})", expr.build_sql(params)),
        }
    }
}

fn compare(column: &Column, op: &str, value: &SqlValue, params: &mut Vec<SqlValue>) -> String {
    params.push(value.clone());
    format!(
        "{} {} {}",
        column.to_sql(),
        op,
        CurrentDialect::placeholder(params.len())
    )
}

type Decoder<R> = Arc<dyn Fn(&CurrentRow) -> Result<R, sqlx::Error> + Send + Sync>;

/// A column list and the decoder reading each selected row.
pub struct Projection<R> {
    columns: Vec<Column>,
    decode: Decoder<R>,
}

impl<R> Projection<R> {
    pub fn new<I, C, F>(columns: I, decode: F) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Column>,
        F: Fn(&CurrentRow) -> Result<R, sqlx::Error> + Send + Sync + 'static,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            decode: Arc::new(decode),
        }
    }
}

impl<R> Projection<R>
where
    R: for<'r> FromRow<'r, CurrentRow> + Send + Unpin + 'static,
{
    /// Selects `columns` and decodes them with `R`'s `FromRow` implementation.
    pub fn of<I, C>(columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Column>,
    {
        Self::new(columns, |row: &CurrentRow| R::from_row(row))
    }
}

#[derive(Debug, Clone)]
enum Source {
    Table(Column),
    Subquery {
        sql: String,
        params: Vec<SqlValue>,
        alias: String,
    },
}

/// A lazily executed SQL `SELECT`.
///
/// Clauses that cannot be added to the current statement without changing its
/// meaning, such as a filter after a `LIMIT`, wrap the statement built so far in
/// a subquery. Qualified column names refer to the original tables only until
/// such a wrap happens.
pub struct SqlQuery<R> {
    db: Database,
    source: Source,
    depth: usize,
    joins: Vec<String>,
    conditions: Vec<SqlExpr>,
    order: Vec<(Column, SortOrder)>,
    limit: Option<u64>,
    offset: Option<u64>,
    columns: Option<Vec<Column>>,
    decode: Decoder<R>,
}

impl<R> Clone for SqlQuery<R> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            source: self.source.clone(),
            depth: self.depth,
            joins: self.joins.clone(),
            conditions: self.conditions.clone(),
            order: self.order.clone(),
            limit: self.limit,
            offset: self.offset,
            columns: self.columns.clone(),
            decode: Arc::clone(&self.decode),
        }
    }
}

impl<R> fmt::Debug for SqlQuery<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (sql, params) = self.to_sql();
        f.debug_struct("SqlQuery")
            .field("sql", &sql)
            .field("params", &params)
            .finish()
    }
}

impl<R> SqlQuery<R> {
    pub fn new<F>(db: Database, table: &str, decode: F) -> Self
    where
        F: Fn(&CurrentRow) -> Result<R, sqlx::Error> + Send + Sync + 'static,
    {
        Self {
            db,
            source: Source::Table(Column::new(table)),
            depth: 0,
            joins: Vec::new(),
            conditions: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            columns: None,
            decode: Arc::new(decode),
        }
    }

    fn is_windowed(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    /// Whether a join can no longer be added to this statement in place.
    ///
    /// `WHERE` and `ORDER BY` only reference the joined tables, so they stay put.
    fn is_closed(&self) -> bool {
        self.is_windowed() || self.columns.is_some()
    }

    /// Turns the statement built so far into the source of a fresh one.
    fn wrap(self) -> Self {
        let (sql, params) = self.to_sql();
        let depth = self.depth + 1;

        Self {
            db: self.db,
            source: Source::Subquery {
                sql,
                params,
                alias: format!("q{depth}"),
            },
            depth,
            joins: Vec::new(),
            conditions: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            columns: None,
            decode: self.decode,
        }
    }

    /// Appends a raw join clause, e.g. `LEFT JOIN tags ON tags.item_id = items.id`.
    ///
    /// Existing conditions and ordering keep their qualified names. A windowed or
    /// projected query is wrapped first.
    pub fn join<T: Into<String>>(self, clause: T) -> Self {
        let mut query = if self.is_closed() { self.wrap() } else { self };
        query.joins.push(clause.into());
        query
    }

    /// Left joins `table` where `left` equals `right`.
    pub fn left_join(self, table: &str, left: &str, right: &str) -> Self {
        let clause = format!(
            "LEFT JOIN {} ON {} = {}",
            CurrentDialect::quote_identifier(table),
            CurrentDialect::quote_identifier(left),
            CurrentDialect::quote_identifier(right)
        );
        self.join(clause)
    }

    /// Renders the statement and its parameters in placeholder order.
    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut params = Vec::new();

        let columns = match &self.columns {
            Some(columns) if !columns.is_empty() => columns
                .iter()
                .map(Column::to_sql)
                .collect::<Vec<_>>()
                .join(", "),
            _ => "*".to_string(),
        };

        let source = match &self.source {
            Source::Table(table) => table.to_sql(),
            Source::Subquery {
                sql,
                params: inner,
                alias,
            } => {
                params.extend(inner.iter().cloned());
                format!("({}) AS {}", sql, CurrentDialect::quote_identifier(alias))
            }
        };

        let mut sql = CurrentDialect::select_statement(&columns, &source);

        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }

        if !self.conditions.is_empty() {
            let clauses = self
                .conditions
                .iter()
                .map(|condition| condition.build_sql(&mut params))
                .collect::<Vec<_>>();
            sql.push_str(&format!(" WHERE {}", clauses.join(" AND ")));
        }

        if !self.order.is_empty() {
            let keys = self
                .order
                .iter()
                .map(|(column, order)| {
                    let direction = match order {
                        SortOrder::Ascending => "ASC",
                        SortOrder::Descending => "DESC",
                    };
                    format!("{} {}", column.to_sql(), direction)
                })
                .collect::<Vec<_>>();
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }

        let limit = self.limit.map(|limit| {
            params.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
            params.len()
        });
        let offset = self.offset.map(|offset| {
            params.push(SqlValue::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));
            params.len()
        });
        sql.push_str(&CurrentDialect::window_clause(limit, offset));

        (sql, params)
    }

    /// Renders the statement counting this query's rows.
    pub fn count_sql(&self) -> (String, Vec<SqlValue>) {
        let (sql, params) = self.to_sql();
        (CurrentDialect::count_statement(&sql), params)
    }
}

impl<R: Send + 'static> LazyQuery for SqlQuery<R> {
    type Item = R;
    type Predicate = SqlExpr;
    type Key = Column;
    type Error = DatabaseError;

    fn filter(self, predicate: SqlExpr) -> Self {
        let mut query = if self.is_windowed() { self.wrap() } else { self };
        query.conditions.push(predicate);
        query
    }

    fn order_by(self, key: Column, order: SortOrder) -> Self {
        let mut query = if self.is_windowed() { self.wrap() } else { self };
        query.order = vec![(key, order)];
        query
    }

    fn then_by(self, key: Column, order: SortOrder) -> Self {
        let mut query = if self.is_windowed() { self.wrap() } else { self };
        query.order.push((key, order));
        query
    }

    fn skip(self, count: u64) -> Self {
        let mut query = if self.limit.is_some() { self.wrap() } else { self };
        query.offset = Some(query.offset.unwrap_or(0).saturating_add(count));
        query
    }

    fn take(mut self, count: u64) -> Self {
        self.limit = Some(self.limit.map_or(count, |limit| limit.min(count)));
        self
    }

    async fn fetch(&self) -> Result<Vec<R>, DatabaseError> {
        let (sql, params) = self.to_sql();
        debug!(sql = %sql, params = params.len(), "fetching rows");

        let rows = self.db.fetch_rows(&sql, &params).await?;

        rows.iter()
            .map(|row| (self.decode)(row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DatabaseError::Decode { source: e })
    }

    async fn count(&self) -> Result<u64, DatabaseError> {
        let (sql, params) = self.count_sql();
        debug!(sql = %sql, params = params.len(), "counting rows");

        self.db.fetch_count(&sql, &params).await
    }
}

impl<R, P> Select<Projection<P>> for SqlQuery<R>
where
    R: Send + 'static,
    P: Send + 'static,
{
    type Output = SqlQuery<P>;

    fn select(self, projection: Projection<P>) -> SqlQuery<P> {
        let query = if self.columns.is_some() { self.wrap() } else { self };

        SqlQuery {
            db: query.db,
            source: query.source,
            depth: query.depth,
            joins: query.joins,
            conditions: query.conditions,
            order: query.order,
            limit: query.limit,
            offset: query.offset,
            columns: Some(projection.columns),
            decode: projection.decode,
        }
    }
}
