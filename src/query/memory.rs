//! In-memory query engine.
//!
//! [`MemoryStore`] holds rows behind an async lock and counts every read as a
//! round trip. [`MemoryQuery`] records operations and replays them over a fresh
//! snapshot of the store each time a terminal operation is awaited.

use super::{LazyQuery, Select, SortOrder};
use futures::{FutureExt, future::BoxFuture};
use std::{
    cmp::Ordering,
    fmt,
    sync::{
        Arc,
        atomic::{self, AtomicBool, AtomicU64},
    },
};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors raised while evaluating a [`MemoryQuery`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// The store was switched off with [`MemoryStore::set_available`].
    #[error("memory store is unavailable")]
    Unavailable,
}

struct StoreInner<T> {
    rows: RwLock<Vec<T>>,
    round_trips: AtomicU64,
    available: AtomicBool,
}

/// A shared, mutable collection of rows that queries read from.
pub struct MemoryStore<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for MemoryStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("round_trips", &self.round_trips())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MemoryStore<T> {
    /// Number of reads performed by terminal query operations so far.
    pub fn round_trips(&self) -> u64 {
        self.inner.round_trips.load(atomic::Ordering::SeqCst)
    }

    /// Makes subsequent reads fail with [`MemoryError::Unavailable`] when `false`.
    pub fn set_available(&self, available: bool) {
        self.inner
            .available
            .store(available, atomic::Ordering::SeqCst);
    }
}

impl<T: Clone + Send + Sync + 'static> MemoryStore<T> {
    pub fn new() -> Self {
        Self::from_rows(Vec::new())
    }

    pub fn from_rows(rows: Vec<T>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                rows: RwLock::new(rows),
                round_trips: AtomicU64::new(0),
                available: AtomicBool::new(true),
            }),
        }
    }

    pub async fn insert(&self, row: T) {
        self.inner.rows.write().await.push(row);
    }

    pub async fn extend<I: IntoIterator<Item = T>>(&self, rows: I) {
        self.inner.rows.write().await.extend(rows);
    }

    pub async fn clear(&self) {
        self.inner.rows.write().await.clear();
    }

    /// Number of stored rows. Not counted as a round trip.
    pub async fn len(&self) -> usize {
        self.inner.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Starts a new lazy query over every row of the store.
    pub fn query(&self) -> MemoryQuery<T> {
        let store = self.clone();

        MemoryQuery::from_upstream(Arc::new(move || {
            let store = store.clone();
            async move { store.snapshot().await }.boxed()
        }))
    }

    async fn snapshot(&self) -> Result<Vec<T>, MemoryError> {
        self.inner.round_trips.fetch_add(1, atomic::Ordering::SeqCst);

        if !self.inner.available.load(atomic::Ordering::SeqCst) {
            return Err(MemoryError::Unavailable);
        }

        Ok(self.inner.rows.read().await.clone())
    }
}

/// Boolean condition over a row.
pub struct Predicate<T>(Arc<dyn Fn(&T) -> bool + Send + Sync>);

impl<T: 'static> Predicate<T> {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    pub fn matches(&self, row: &T) -> bool {
        (self.0)(row)
    }
}

impl<T> Clone for Predicate<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

/// Sort key extracted from a row, erased into a comparator.
pub struct KeySelector<T>(Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>);

impl<T: 'static> KeySelector<T> {
    pub fn new<K, F>(select: F) -> Self
    where
        K: Ord,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self(Arc::new(move |a: &T, b: &T| select(a).cmp(&select(b))))
    }

    pub fn compare(&self, a: &T, b: &T) -> Ordering {
        (self.0)(a, b)
    }
}

impl<T> Clone for KeySelector<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

type Upstream<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<T>, MemoryError>> + Send + Sync>;

enum Op<T> {
    Filter(Predicate<T>),
    Sort(Vec<(KeySelector<T>, SortOrder)>),
    Skip(u64),
    Take(u64),
}

impl<T> Clone for Op<T> {
    fn clone(&self) -> Self {
        match self {
            Op::Filter(predicate) => Op::Filter(predicate.clone()),
            Op::Sort(keys) => Op::Sort(keys.clone()),
            Op::Skip(count) => Op::Skip(*count),
            Op::Take(count) => Op::Take(*count),
        }
    }
}

/// A deferred pipeline of operations over a [`MemoryStore`].
pub struct MemoryQuery<T> {
    upstream: Upstream<T>,
    ops: Vec<Op<T>>,
}

impl<T> Clone for MemoryQuery<T> {
    fn clone(&self) -> Self {
        Self {
            upstream: Arc::clone(&self.upstream),
            ops: self.ops.clone(),
        }
    }
}

impl<T> fmt::Debug for MemoryQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryQuery")
            .field("ops", &self.ops.len())
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> MemoryQuery<T> {
    fn from_upstream(upstream: Upstream<T>) -> Self {
        Self {
            upstream,
            ops: Vec::new(),
        }
    }

    fn push(mut self, op: Op<T>) -> Self {
        self.ops.push(op);
        self
    }

    /// Evaluates this query and feeds the rows through `step`, producing a new
    /// query rooted at the result.
    fn chain<U, F>(self, step: F) -> MemoryQuery<U>
    where
        U: Send + Sync + 'static,
        F: Fn(Vec<T>) -> BoxFuture<'static, Result<Vec<U>, MemoryError>> + Send + Sync + 'static,
    {
        let step = Arc::new(step);

        MemoryQuery::from_upstream(Arc::new(move || {
            let source = self.clone();
            let step = Arc::clone(&step);
            async move {
                let rows = source.fetch().await?;
                step(rows).await
            }
            .boxed()
        }))
    }

    /// Attaches rows of a related store to each row during evaluation.
    ///
    /// The related store is read once per evaluation, alongside the primary
    /// read, and `attach` is called for every row with the related snapshot.
    pub fn include<U, F>(self, related: &MemoryStore<U>, attach: F) -> Self
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&mut T, &[U]) + Send + Sync + 'static,
    {
        let related = related.clone();
        let attach = Arc::new(attach);

        self.chain(move |mut rows| {
            let related = related.clone();
            let attach = Arc::clone(&attach);
            async move {
                let related_rows = related.snapshot().await?;
                for row in rows.iter_mut() {
                    attach(row, &related_rows);
                }
                Ok::<_, MemoryError>(rows)
            }
            .boxed()
        })
    }

    fn apply(&self, mut rows: Vec<T>) -> Vec<T> {
        for op in &self.ops {
            match op {
                Op::Filter(predicate) => rows.retain(|row| predicate.matches(row)),
                Op::Sort(keys) => rows.sort_by(|a, b| {
                    keys.iter()
                        .map(|(key, order)| order.apply(key.compare(a, b)))
                        .find(|ordering| ordering.is_ne())
                        .unwrap_or(Ordering::Equal)
                }),
                Op::Skip(count) => {
                    let count = usize::try_from(*count).unwrap_or(usize::MAX).min(rows.len());
                    rows.drain(..count);
                }
                Op::Take(count) => rows.truncate(usize::try_from(*count).unwrap_or(usize::MAX)),
            }
        }

        rows
    }
}

impl<T: Send + Sync + 'static> LazyQuery for MemoryQuery<T> {
    type Item = T;
    type Predicate = Predicate<T>;
    type Key = KeySelector<T>;
    type Error = MemoryError;

    fn filter(self, predicate: Predicate<T>) -> Self {
        self.push(Op::Filter(predicate))
    }

    fn order_by(self, key: KeySelector<T>, order: SortOrder) -> Self {
        self.push(Op::Sort(vec![(key, order)]))
    }

    fn then_by(mut self, key: KeySelector<T>, order: SortOrder) -> Self {
        // filters keep relative order, so the latest sort before any window still applies
        let current = self
            .ops
            .iter_mut()
            .rev()
            .take_while(|op| !matches!(op, Op::Skip(_) | Op::Take(_)))
            .find_map(|op| match op {
                Op::Sort(keys) => Some(keys),
                _ => None,
            });

        match current {
            Some(keys) => {
                keys.push((key, order));
                self
            }
            None => self.order_by(key, order),
        }
    }

    fn skip(self, count: u64) -> Self {
        self.push(Op::Skip(count))
    }

    fn take(self, count: u64) -> Self {
        self.push(Op::Take(count))
    }

    async fn fetch(&self) -> Result<Vec<T>, MemoryError> {
        let rows = (self.upstream)().await?;
        Ok(self.apply(rows))
    }

    async fn count(&self) -> Result<u64, MemoryError> {
        Ok(self.fetch().await?.len() as u64)
    }
}

impl<T, R, F> Select<F> for MemoryQuery<T>
where
    T: Send + Sync + 'static,
    R: Send + Sync + 'static,
    F: Fn(&T) -> R + Send + Sync + 'static,
{
    type Output = MemoryQuery<R>;

    fn select(self, projection: F) -> MemoryQuery<R> {
        let projection = Arc::new(projection);

        self.chain(move |rows| {
            let projection = Arc::clone(&projection);
            async move { Ok::<_, MemoryError>(rows.iter().map(|row| projection(row)).collect()) }
                .boxed()
        })
    }
}
