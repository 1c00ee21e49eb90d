//! # Page Composition
//!
//! [`QueryComposer`] turns a base [`LazyQuery`] into the query for a single page
//! plus a deferred count of every row the page is drawn from. Composition never
//! executes anything: the returned [`PagedResult`] holds two independent lazy
//! operations, each costing one round trip when awaited.
//!
//! Stages always run in the same order:
//!
//! 1. **include**: the eager-load directive is applied to the base query.
//! 2. **filter**: the predicate is applied; this query is also the source of
//!    [`CountTotal`].
//! 3. **sort**: the first key orders, later keys break ties.
//! 4. **paginate**: `take(size)` on the first page, `skip(offset).take(size)` after it.
//! 5. **project**: only with [`QueryComposer::compose_with`]; the count is unaffected.
//!
//! ```no_run
//! use querypage::prelude::*;
//!
//! async fn second_page(store: &MemoryStore<(u32, String)>) -> Result<(), MemoryError> {
//!     let result = store
//!         .query()
//!         .paginate()
//!         .page(2)
//!         .size(10)
//!         .filter(Predicate::new(|row: &(u32, String)| row.0 % 2 == 0))
//!         .order_by(KeySelector::new(|row: &(u32, String)| row.1.clone()), SortOrder::Ascending)
//!         .compose_with(|row: &(u32, String)| row.1.clone())
//!         .expect("page and size are set");
//!
//!     let names = result.fetch().await?;
//!     let total = result.count_total.get().await?;
//!     println!("{} of {}", names.len(), total);
//!     Ok(())
//! }
//! ```

use crate::{
    page::{PAGE_SIZE_DEFAULT, PageInfo, PageRequest},
    query::{LazyQuery, Select, SortKey, SortOrder},
};
use futures::{FutureExt, future::BoxFuture};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::debug;

/// Errors detected while composing a page, before any query runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    /// `page` or `size` was explicitly set to no value.
    #[error("missing required argument `{name}`")]
    MissingRequiredArgument { name: &'static str },

    /// `page` or `size` was zero.
    #[error("argument `{name}` must be at least 1, got {value}")]
    OutOfRange { name: &'static str, value: u32 },
}

/// Eager-load directive applied to the base query before filtering.
pub type Include<Q> = Box<dyn FnOnce(Q) -> Q + Send>;

/// Builder for a paged query over `Q`.
///
/// `page` and `size` default to `1` and [`PAGE_SIZE_DEFAULT`]. Passing `None` to
/// [`page`](QueryComposer::page) or [`size`](QueryComposer::size) clears the value,
/// which makes composition fail instead of falling back to the default.
pub struct QueryComposer<Q: LazyQuery> {
    base: Q,
    page: Option<u32>,
    size: Option<u32>,
    filter: Option<Q::Predicate>,
    includes: Option<Include<Q>>,
    sort_keys: Vec<SortKey<Q::Key>>,
}

impl<Q: LazyQuery> QueryComposer<Q> {
    pub fn new(base: Q) -> Self {
        Self {
            base,
            page: Some(1),
            size: Some(PAGE_SIZE_DEFAULT),
            filter: None,
            includes: None,
            sort_keys: Vec::new(),
        }
    }

    /// Sets the 1-indexed page number.
    pub fn page<P: Into<Option<u32>>>(mut self, page: P) -> Self {
        self.page = page.into();
        self
    }

    /// Sets the number of rows per page.
    pub fn size<S: Into<Option<u32>>>(mut self, size: S) -> Self {
        self.size = size.into();
        self
    }

    /// Sets the predicate rows must match. Replaces a previously set predicate.
    pub fn filter(mut self, predicate: Q::Predicate) -> Self {
        self.filter = Some(predicate);
        self
    }

    /// Sets the eager-load directive. Replaces a previously set directive.
    pub fn include<F>(mut self, include: F) -> Self
    where
        F: FnOnce(Q) -> Q + Send + 'static,
    {
        self.includes = Some(Box::new(include));
        self
    }

    /// Appends a sort key. Keys after the first only break ties.
    pub fn order_by(mut self, key: Q::Key, order: SortOrder) -> Self {
        self.sort_keys.push(SortKey::new(key, order));
        self
    }

    /// Appends several sort keys in order.
    pub fn sort_keys<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = SortKey<Q::Key>>,
    {
        self.sort_keys.extend(keys);
        self
    }

    fn request(&self) -> Result<PageRequest, ComposeError> {
        let page = required("page", self.page)?;
        let size = required("size", self.size)?;

        Ok(PageRequest::new(page, size))
    }

    /// Runs the pipeline, returning the paged query and the filtered query.
    fn build(self) -> Result<(Q, Q, PageRequest), ComposeError> {
        let request = self.request()?;

        let mut query = self.base;

        if let Some(include) = self.includes {
            query = include(query);
        }

        if let Some(predicate) = self.filter {
            query = query.filter(predicate);
        }

        let filtered = query.clone();
        let sort_count = self.sort_keys.len();

        let mut keys = self.sort_keys.into_iter();
        if let Some(primary) = keys.next() {
            query = query.order_by(primary.key, primary.order);
            for key in keys {
                query = query.then_by(key.key, key.order);
            }
        }

        let skip_count = request.offset();
        let size = u64::from(request.size);

        debug!(
            page = request.page,
            size = request.size,
            skip_count,
            sort_keys = sort_count,
            "composing page"
        );

        let paged = if skip_count == 0 {
            query.take(size)
        } else {
            query.skip(skip_count).take(size)
        };

        Ok((paged, filtered, request))
    }

    /// Composes the page without projection.
    pub fn compose(self) -> Result<PagedResult<Q>, ComposeError> {
        let (paged, filtered, request) = self.build()?;

        Ok(PagedResult {
            paged_query: paged,
            count_total: CountTotal::deferred(filtered),
            request,
        })
    }

    /// Composes the page and projects each row with `projection`.
    pub fn compose_with<P>(
        self,
        projection: P,
    ) -> Result<PagedResult<<Q as Select<P>>::Output>, ComposeError>
    where
        Q: Select<P>,
    {
        let (paged, filtered, request) = self.build()?;

        Ok(PagedResult {
            paged_query: paged.select(projection),
            count_total: CountTotal::deferred(filtered),
            request,
        })
    }
}

fn required(name: &'static str, value: Option<u32>) -> Result<u32, ComposeError> {
    match value {
        None => Err(ComposeError::MissingRequiredArgument { name }),
        Some(0) => Err(ComposeError::OutOfRange { name, value: 0 }),
        Some(value) => Ok(value),
    }
}

/// Starts a [`QueryComposer`] from any lazy query.
pub trait Paginate: LazyQuery {
    fn paginate(self) -> QueryComposer<Self> {
        QueryComposer::new(self)
    }
}

impl<Q: LazyQuery> Paginate for Q {}

/// Deferred count over the filtered, unpaged query.
///
/// Every call to [`get`](CountTotal::get) executes a new count; nothing is cached,
/// so concurrent writes between calls show up in the result.
pub struct CountTotal<E> {
    run: Arc<dyn Fn() -> BoxFuture<'static, Result<u64, E>> + Send + Sync>,
}

impl<E> Clone for CountTotal<E> {
    fn clone(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
        }
    }
}

impl<E> fmt::Debug for CountTotal<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountTotal").finish_non_exhaustive()
    }
}

impl<E: Send + 'static> CountTotal<E> {
    fn deferred<Q: LazyQuery<Error = E>>(query: Q) -> Self {
        Self {
            run: Arc::new(move || {
                let query = query.clone();
                async move { query.count().await }.boxed()
            }),
        }
    }

    /// Executes the count.
    pub async fn get(&self) -> Result<u64, E> {
        (self.run)().await
    }
}

/// A composed page: the lazy page query and the deferred total count.
pub struct PagedResult<P: LazyQuery> {
    pub paged_query: P,
    pub count_total: CountTotal<P::Error>,
    pub request: PageRequest,
}

impl<P: LazyQuery + fmt::Debug> fmt::Debug for PagedResult<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagedResult")
            .field("paged_query", &self.paged_query)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl<P: LazyQuery> PagedResult<P> {
    /// Enumerates the page.
    pub async fn fetch(&self) -> Result<Vec<P::Item>, P::Error> {
        self.paged_query.fetch().await
    }

    /// Counts the total once and describes where this page sits.
    pub async fn page_info(&self) -> Result<PageInfo, P::Error> {
        let total = self.count_total.get().await?;
        Ok(PageInfo::new(self.request, total))
    }
}

#[cfg(test)]
mod tests {
    use super::{ComposeError, Paginate, QueryComposer};
    use crate::{
        page::PageInfo,
        query::{
            LazyQuery, SortKey, SortOrder,
            memory::{KeySelector, MemoryError, MemoryQuery, MemoryStore, Predicate},
        },
    };

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: u32,
        a: u32,
        b: u32,
        label: Option<String>,
    }

    fn row(id: u32, a: u32, b: u32) -> Row {
        Row {
            id,
            a,
            b,
            label: None,
        }
    }

    fn numbered(count: u32) -> MemoryStore<Row> {
        MemoryStore::from_rows((1..=count).map(|id| row(id, id % 3, id)).collect())
    }

    fn ids(rows: &[Row]) -> Vec<u32> {
        rows.iter().map(|r| r.id).collect()
    }

    fn by_id() -> KeySelector<Row> {
        KeySelector::new(|r: &Row| r.id)
    }

    #[tokio::test]
    async fn test_pages_over_twenty_five_rows() {
        let store = numbered(25);

        let first = QueryComposer::new(store.query())
            .size(10)
            .filter(Predicate::new(|_: &Row| true))
            .order_by(by_id(), SortOrder::Ascending)
            .compose()
            .unwrap();
        assert_eq!((1..=10).collect::<Vec<_>>(), ids(&first.fetch().await.unwrap()));

        let third = QueryComposer::new(store.query())
            .page(3)
            .size(10)
            .order_by(by_id(), SortOrder::Ascending)
            .compose()
            .unwrap();
        assert_eq!((21..=25).collect::<Vec<_>>(), ids(&third.fetch().await.unwrap()));
        assert_eq!(25, third.count_total.get().await.unwrap());
    }

    #[tokio::test]
    async fn test_defaults_to_first_page_of_twelve() {
        let store = numbered(30);

        let result = store.query().paginate().compose().unwrap();

        assert_eq!(1, result.request.page);
        assert_eq!(12, result.request.size);
        assert_eq!((1..=12).collect::<Vec<_>>(), ids(&result.fetch().await.unwrap()));
    }

    #[tokio::test]
    async fn test_explicit_missing_page_fails_before_execution() {
        let store = numbered(5);

        let err = QueryComposer::new(store.query())
            .page(None::<u32>)
            .compose()
            .unwrap_err();
        assert_eq!(ComposeError::MissingRequiredArgument { name: "page" }, err);

        let err = QueryComposer::new(store.query())
            .size(None::<u32>)
            .compose_with(|r: &Row| r.id)
            .unwrap_err();
        assert_eq!(ComposeError::MissingRequiredArgument { name: "size" }, err);

        assert_eq!(0, store.round_trips());
    }

    #[tokio::test]
    async fn test_zero_page_or_size_is_rejected() {
        let store = numbered(5);

        assert_eq!(
            ComposeError::OutOfRange {
                name: "page",
                value: 0
            },
            store.query().paginate().page(0).compose().unwrap_err()
        );
        assert_eq!(
            ComposeError::OutOfRange {
                name: "size",
                value: 0
            },
            store.query().paginate().size(0).compose().unwrap_err()
        );
    }

    #[tokio::test]
    async fn test_composition_does_not_touch_store() {
        let store = numbered(5);

        let result = store
            .query()
            .paginate()
            .page(2)
            .size(2)
            .filter(Predicate::new(|r: &Row| r.id > 1))
            .include(|q: MemoryQuery<Row>| q.take(100))
            .order_by(by_id(), SortOrder::Descending)
            .compose_with(|r: &Row| r.id)
            .unwrap();
        assert_eq!(0, store.round_trips());

        assert_eq!(vec![3, 2], result.fetch().await.unwrap());
        assert_eq!(1, store.round_trips());
        assert_eq!(4, result.count_total.get().await.unwrap());
        assert_eq!(2, store.round_trips());
    }

    #[tokio::test]
    async fn test_page_elements_follow_filtered_order() {
        let store = numbered(40);
        let (page, size) = (2u32, 5u32);

        let full = store
            .query()
            .filter(Predicate::new(|r: &Row| r.a == 1))
            .order_by(KeySelector::new(|r: &Row| r.b), SortOrder::Descending)
            .fetch()
            .await
            .unwrap();

        let result = store
            .query()
            .paginate()
            .page(page)
            .size(size)
            .filter(Predicate::new(|r: &Row| r.a == 1))
            .order_by(KeySelector::new(|r: &Row| r.b), SortOrder::Descending)
            .compose()
            .unwrap();
        let rows = result.fetch().await.unwrap();

        assert!(rows.len() <= size as usize);
        for (k, r) in rows.iter().enumerate() {
            assert_eq!(&full[((page - 1) * size) as usize + k], r);
        }
    }

    #[tokio::test]
    async fn test_count_ignores_paging_sorting_and_projection() {
        let store = numbered(25);
        let even = || Predicate::new(|r: &Row| r.id % 2 == 0);

        let plain = store.query().paginate().filter(even()).compose().unwrap();
        let projected = store
            .query()
            .paginate()
            .page(4)
            .size(3)
            .filter(even())
            .order_by(by_id(), SortOrder::Descending)
            .compose_with(|r: &Row| format!("row-{}", r.id))
            .unwrap();

        assert_eq!(12, plain.count_total.get().await.unwrap());
        assert_eq!(12, projected.count_total.get().await.unwrap());
    }

    #[tokio::test]
    async fn test_projection_preserves_cardinality() {
        let store = numbered(11);

        let compose = || {
            QueryComposer::new(store.query())
                .page(2)
                .size(4)
                .filter(Predicate::new(|r: &Row| r.id != 3))
                .order_by(by_id(), SortOrder::Ascending)
        };

        let rows = compose().compose().unwrap().fetch().await.unwrap();
        let labels = compose()
            .compose_with(|r: &Row| format!("#{}", r.id))
            .unwrap()
            .fetch()
            .await
            .unwrap();

        assert_eq!(rows.len(), labels.len());
        assert_eq!(vec!["#6", "#7", "#8", "#9"], labels);
    }

    #[tokio::test]
    async fn test_composing_twice_is_idempotent() {
        let store = numbered(20);

        let compose = || {
            store
                .query()
                .paginate()
                .page(2)
                .size(6)
                .filter(Predicate::new(|r: &Row| r.a != 0))
                .order_by(KeySelector::new(|r: &Row| r.a), SortOrder::Ascending)
                .order_by(by_id(), SortOrder::Ascending)
                .compose()
                .unwrap()
        };

        let (first, second) = (compose(), compose());
        assert_eq!(first.fetch().await.unwrap(), second.fetch().await.unwrap());
        assert_eq!(
            first.count_total.get().await.unwrap(),
            second.count_total.get().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_sort_keys_break_ties_in_order() {
        let store = MemoryStore::from_rows(vec![
            row(1, 2, 1),
            row(2, 1, 1),
            row(3, 2, 3),
            row(4, 1, 2),
            row(5, 1, 3),
        ]);

        let result = store
            .query()
            .paginate()
            .sort_keys([
                SortKey::asc(KeySelector::new(|r: &Row| r.a)),
                SortKey::desc(KeySelector::new(|r: &Row| r.b)),
            ])
            .compose()
            .unwrap();

        assert_eq!(vec![5, 4, 2, 3, 1], ids(&result.fetch().await.unwrap()));
    }

    #[tokio::test]
    async fn test_sort_applies_to_filtered_rows() {
        let store = numbered(10);

        // ids 1..=10 descending, keeping only a == 0: 9, 6, 3
        let result = store
            .query()
            .paginate()
            .size(2)
            .filter(Predicate::new(|r: &Row| r.a == 0))
            .order_by(by_id(), SortOrder::Descending)
            .compose()
            .unwrap();

        assert_eq!(vec![9, 6], ids(&result.fetch().await.unwrap()));
        assert_eq!(3, result.count_total.get().await.unwrap());
    }

    #[tokio::test]
    async fn test_first_page_matches_explicit_skip_zero() {
        let store = numbered(9);

        let composed = store
            .query()
            .paginate()
            .size(4)
            .order_by(by_id(), SortOrder::Descending)
            .compose()
            .unwrap()
            .fetch()
            .await
            .unwrap();

        let explicit = store
            .query()
            .order_by(by_id(), SortOrder::Descending)
            .skip(0)
            .take(4)
            .fetch()
            .await
            .unwrap();

        assert_eq!(explicit, composed);
    }

    #[tokio::test]
    async fn test_count_total_is_not_cached() {
        let store = numbered(3);
        let result = store.query().paginate().size(2).compose().unwrap();

        assert_eq!(3, result.count_total.get().await.unwrap());
        store.extend([row(4, 0, 0), row(5, 0, 0)]).await;
        assert_eq!(5, result.count_total.get().await.unwrap());

        let count = result.count_total.clone();
        store.clear().await;
        assert_eq!(0, count.get().await.unwrap());
        assert_eq!(3, store.round_trips());
    }

    #[tokio::test]
    async fn test_include_runs_before_filter_and_count() {
        let store = numbered(6);
        let labels = MemoryStore::from_rows(vec![(2u32, "two".to_string()), (5, "five".to_string())]);
        let related = labels.clone();

        let result = store
            .query()
            .paginate()
            .include(move |q: MemoryQuery<Row>| {
                q.include(&related, |r: &mut Row, labels: &[(u32, String)]| {
                    r.label = labels
                        .iter()
                        .find(|(id, _)| *id == r.id)
                        .map(|(_, label)| label.clone());
                })
            })
            .filter(Predicate::new(|r: &Row| r.label.is_some()))
            .compose_with(|r: &Row| r.label.clone().unwrap_or_default())
            .unwrap();

        assert_eq!(vec!["two", "five"], result.fetch().await.unwrap());
        assert_eq!(2, result.count_total.get().await.unwrap());
    }

    #[tokio::test]
    async fn test_execution_errors_pass_through() {
        let store = numbered(3);
        let result = store.query().paginate().compose().unwrap();

        store.set_available(false);

        assert_eq!(MemoryError::Unavailable, result.fetch().await.unwrap_err());
        assert_eq!(
            MemoryError::Unavailable,
            result.count_total.get().await.unwrap_err()
        );
    }

    #[tokio::test]
    async fn test_page_info_uses_count() {
        let store = numbered(25);

        let info = store
            .query()
            .paginate()
            .page(3)
            .size(10)
            .compose()
            .unwrap()
            .page_info()
            .await
            .unwrap();

        assert_eq!(
            PageInfo {
                page: 3,
                size: 10,
                total: 25,
                total_pages: 3,
                has_next: false,
                has_prev: true,
            },
            info
        );
    }

    #[cfg(feature = "sqlite")]
    mod sql {
        use super::super::QueryComposer;
        use crate::{
            database::tests::get_db,
            query::{
                LazyQuery, SortOrder,
                sql::{Column, Projection, SqlQuery, SqlValue},
            },
        };
        use sqlx::FromRow;

        #[allow(dead_code)]
        #[derive(Debug, Clone, PartialEq, FromRow)]
        struct Book {
            id: i64,
            title: String,
            year: i64,
        }

        #[derive(Debug, Clone, PartialEq, FromRow)]
        struct Listing {
            title: String,
            author_name: String,
        }

        #[tokio::test]
        async fn test_compose_sql_page() {
            let db = get_db().await;
            db.execute(
                r#"CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT NOT NULL, year INTEGER NOT NULL, author_id INTEGER);
                CREATE TABLE authors (author_ref INTEGER PRIMARY KEY, author_name TEXT NOT NULL);
                INSERT INTO authors (author_ref, author_name) VALUES (1, 'Le Guin'), (2, 'Lem');
                INSERT INTO books (id, title, year, author_id) VALUES
                    (1, 'A Wizard of Earthsea', 1968, 1),
                    (2, 'Solaris', 1961, 2),
                    (3, 'The Dispossessed', 1974, 1),
                    (4, 'The Cyberiad', 1965, 2),
                    (5, 'The Left Hand of Darkness', 1969, 1),
                    (6, 'Fiasco', 1986, 2);"#,
            )
            .await
            .unwrap();

            let result = QueryComposer::new(db.table::<Book>("books"))
                .page(2)
                .size(2)
                .include(|q: SqlQuery<Book>| {
                    q.left_join("authors", "authors.author_ref", "books.author_id")
                })
                .filter(Column::new("books.year").ge(1965))
                .order_by(Column::new("authors.author_name"), SortOrder::Ascending)
                .order_by(Column::new("books.year"), SortOrder::Descending)
                .compose_with(Projection::<Listing>::of([
                    "books.title",
                    "authors.author_name",
                ]))
                .unwrap();

            let (sql, params) = result.paged_query.to_sql();
            assert_eq!(
                r#"SELECT "books"."title", "authors"."author_name" FROM "books" LEFT JOIN "authors" ON "authors"."author_ref" = "books"."author_id" WHERE "books"."year" >= ? ORDER BY "authors"."author_name" ASC, "books"."year" DESC LIMIT ? OFFSET ?"#,
                sql
            );
            assert_eq!(
                vec![
                    SqlValue::Integer(1965),
                    SqlValue::Integer(2),
                    SqlValue::Integer(2),
                ],
                params
            );

            // Le Guin: 1974, 1969, 1968; Lem: 1986, 1965
            assert_eq!(
                vec![
                    Listing {
                        title: "A Wizard of Earthsea".to_string(),
                        author_name: "Le Guin".to_string(),
                    },
                    Listing {
                        title: "Fiasco".to_string(),
                        author_name: "Lem".to_string(),
                    },
                ],
                result.fetch().await.unwrap()
            );
            assert_eq!(5, result.count_total.get().await.unwrap());
        }

        #[tokio::test]
        async fn test_include_on_filtered_base() {
            let db = get_db().await;
            db.execute(
                r#"CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT NOT NULL, year INTEGER NOT NULL, author_id INTEGER);
                CREATE TABLE authors (author_ref INTEGER PRIMARY KEY, author_name TEXT NOT NULL);
                INSERT INTO authors (author_ref, author_name) VALUES (1, 'Le Guin'), (2, 'Lem');
                INSERT INTO books (id, title, year, author_id) VALUES
                    (1, 'A Wizard of Earthsea', 1968, 1),
                    (2, 'Solaris', 1961, 2),
                    (3, 'The Dispossessed', 1974, 1);"#,
            )
            .await
            .unwrap();

            let base = db
                .table::<Book>("books")
                .filter(Column::new("books.id").ge(2));

            let result = QueryComposer::new(base)
                .include(|q: SqlQuery<Book>| {
                    q.left_join("authors", "authors.author_ref", "books.author_id")
                })
                .order_by(Column::new("books.year"), SortOrder::Ascending)
                .compose_with(Projection::<Listing>::of([
                    "books.title",
                    "authors.author_name",
                ]))
                .unwrap();

            assert_eq!(
                vec![
                    Listing {
                        title: "Solaris".to_string(),
                        author_name: "Lem".to_string(),
                    },
                    Listing {
                        title: "The Dispossessed".to_string(),
                        author_name: "Le Guin".to_string(),
                    },
                ],
                result.fetch().await.unwrap()
            );
            assert_eq!(2, result.count_total.get().await.unwrap());
        }

        #[tokio::test]
        async fn test_first_sql_page_has_no_offset() {
            let db = get_db().await;

            let result = QueryComposer::new(db.table::<Book>("books"))
                .size(3)
                .compose()
                .unwrap();

            let (sql, params) = result.paged_query.to_sql();
            assert_eq!(r#"SELECT * FROM "books" LIMIT ?"#, sql);
            assert_eq!(vec![SqlValue::Integer(3)], params);
        }
    }
}
