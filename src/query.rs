//! Lazy query abstraction consumed by the composer.
//!
//! A [`LazyQuery`] is a description of a data request that is only executed
//! when one of its terminal operations ([`LazyQuery::fetch`] or
//! [`LazyQuery::count`]) is awaited. Every other operation returns a new query
//! value and never touches the underlying store.
//!
//! Two engines are provided:
//!
//! - [`memory`]: a deferred pipeline over a shared in-memory row store.
//! - [`sql`]: a deferred SQL builder executed through an sqlx pool.

use serde::{Deserialize, Serialize};
use std::future::Future;

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sql;

/// Direction of a single sort key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    /// Applies this direction to an ascending comparison result.
    pub fn apply(self, ordering: std::cmp::Ordering) -> std::cmp::Ordering {
        match self {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortOrder::Ascending),
            "desc" | "descending" => Ok(SortOrder::Descending),
            other => Err(format!("unknown sort order `{other}`")),
        }
    }
}

/// A key selector paired with its direction.
#[derive(Debug, Clone)]
pub struct SortKey<K> {
    pub key: K,
    pub order: SortOrder,
}

impl<K> SortKey<K> {
    pub fn new(key: K, order: SortOrder) -> Self {
        Self { key, order }
    }

    pub fn asc(key: K) -> Self {
        Self::new(key, SortOrder::Ascending)
    }

    pub fn desc(key: K) -> Self {
        Self::new(key, SortOrder::Descending)
    }
}

/// A composable, lazily evaluated sequence of [`LazyQuery::Item`].
///
/// Operations follow sequence semantics: an operation applied after
/// [`skip`](LazyQuery::skip) or [`take`](LazyQuery::take) works on the already
/// windowed sequence. Implementations keep clones cheap, since the composer
/// shares one filtered query between the page and the deferred count.
pub trait LazyQuery: Clone + Send + Sync + 'static {
    /// Element type produced on enumeration.
    type Item: Send;

    /// Boolean expression over [`Self::Item`] understood by this engine.
    type Predicate;

    /// Sort key selector understood by this engine.
    type Key;

    /// Failure surfaced by the engine when a terminal operation runs.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Keeps only the elements matching `predicate`.
    fn filter(self, predicate: Self::Predicate) -> Self;

    /// Orders by `key`, replacing any ordering already present.
    fn order_by(self, key: Self::Key, order: SortOrder) -> Self;

    /// Adds `key` as a tie-breaker for the current ordering.
    ///
    /// Filters applied since the ordering do not reset it. Behaves like
    /// [`order_by`](LazyQuery::order_by) when no ordering exists or a
    /// [`skip`](LazyQuery::skip) or [`take`](LazyQuery::take) followed it.
    fn then_by(self, key: Self::Key, order: SortOrder) -> Self;

    /// Bypasses the first `count` elements.
    fn skip(self, count: u64) -> Self;

    /// Yields at most `count` elements.
    fn take(self, count: u64) -> Self;

    /// Executes the query and collects its elements. One round trip.
    fn fetch(&self) -> impl Future<Output = Result<Vec<Self::Item>, Self::Error>> + Send;

    /// Executes a count over the query. One round trip.
    fn count(&self) -> impl Future<Output = Result<u64, Self::Error>> + Send;
}

/// Projection of a query's elements into another shape.
///
/// The projected query fails with the same error type as its source so that a
/// projected page and its count report execution failures alike.
pub trait Select<P>: LazyQuery {
    type Output: LazyQuery<Error = Self::Error>;

    fn select(self, projection: P) -> Self::Output;
}
