//! # SQL Dialect Module
//!
//! This module defines the `Dialect` trait, which abstracts over the differences in
//! SQL syntax across database systems. The SQL query engine renders every statement
//! through the current dialect so that placeholder syntax, identifier quoting and
//! window clauses stay consistent.
//!
//! The current dialect is chosen at compile time by feature flags. When the `sqlite`
//! feature is enabled, the `CurrentDialect` type alias is set to `sqlite::SqliteDialect`.

#[cfg(feature = "sqlite")]
mod sqlite;

/// The current SQL dialect used at compile time, determined by feature flags.
#[cfg(feature = "sqlite")]
pub type CurrentDialect = sqlite::SqliteDialect;

#[cfg(feature = "sqlite")]
pub type Db = sqlx::Sqlite;

#[cfg(feature = "sqlite")]
pub type CurrentRow = sqlx::sqlite::SqliteRow;

#[cfg(feature = "sqlite")]
pub type CurrentArguments<'q> = sqlx::sqlite::SqliteArguments<'q>;

/// A trait for SQL dialects to support database-specific query generation.
pub trait Dialect {
    /// Returns the SQL placeholder syntax for the given parameter index.
    ///
    /// SQLite uses a bare `?` for every index.
    ///
    /// # Parameters
    /// - `idx`: The 1-based parameter index (used in dialects that number placeholders).
    fn placeholder(idx: usize) -> String;

    /// Quotes a possibly qualified identifier such as `books.title`.
    ///
    /// Every dot separated segment is quoted on its own and embedded quotes are doubled.
    fn quote_identifier(name: &str) -> String {
        name.split('.')
            .map(|segment| format!("\"{}\"", segment.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Returns the window clause for the given placeholder indices, with a leading space.
    ///
    /// # Parameters
    /// - `limit`: Index of the bound `LIMIT` value, if any.
    /// - `offset`: Index of the bound `OFFSET` value, if any.
    fn window_clause(limit: Option<usize>, offset: Option<usize>) -> String {
        let mut clause = String::new();

        if let Some(idx) = limit {
            clause.push_str(&format!(" LIMIT {}", Self::placeholder(idx)));
        }

        if let Some(idx) = offset {
            clause.push_str(&format!(" OFFSET {}", Self::placeholder(idx)));
        }

        clause
    }

    /// Returns the `SELECT` statement head for the given column list and source.
    fn select_statement(columns: &str, source: &str) -> String {
        format!("SELECT {} FROM {}", columns, source)
    }

    /// Returns the SQL statement counting the rows produced by `inner`.
    fn count_statement(inner: &str) -> String {
        format!("SELECT COUNT(*) FROM ({}) AS counted", inner)
    }
}
