//! # Paged Query Composition
//!
//! This crate turns a base lazy query into the query for one page of results,
//! filtered, sorted and optionally projected, together with a deferred function
//! counting every row the page is drawn from. Composing never executes anything;
//! the page and the count each cost one round trip when awaited.
//!
//! ## Features
//!
//! - **Fixed pipeline**: include, filter, sort, paginate and project always run in
//!   that order, and the count shares the filtered query with the page.
//! - **Engine agnostic**: any type implementing [`query::LazyQuery`] can be paged.
//! - **In-memory engine**: [`query::memory`] for tests and small data sets.
//! - **SQL engine**: [`query::sql`] renders typed, parameterised SQL and executes it
//!   through an sqlx pool.
//!
//! ## Usage
//!
//! ```no_run
//! use querypage::prelude::*;
//!
//! #[derive(Debug, sqlx::FromRow)]
//! struct Book {
//!     title: String,
//!     year: i64,
//! }
//!
//! async fn newest_books(db: &Database) -> Result<(), DatabaseError> {
//!     let result = db
//!         .table::<Book>("books")
//!         .paginate()
//!         .page(2)
//!         .size(20)
//!         .filter(Column::new("year").ge(2000))
//!         .order_by(Column::new("year"), SortOrder::Descending)
//!         .order_by(Column::new("title"), SortOrder::Ascending)
//!         .compose()
//!         .expect("page and size are set");
//!
//!     for book in result.fetch().await? {
//!         println!("{} ({})", book.title, book.year);
//!     }
//!
//!     println!("{:?}", result.page_info().await?);
//!     Ok(())
//! }
//! ```

pub mod compose;
#[cfg(feature = "sqlite")]
pub mod database;
#[cfg(feature = "sqlite")]
mod dialect;
pub mod page;
pub mod query;

pub mod prelude {
    pub use crate::compose::{ComposeError, CountTotal, Paginate, PagedResult, QueryComposer};
    #[cfg(feature = "sqlite")]
    pub use crate::database::{Database, DatabaseError};
    pub use crate::page::{PAGE_SIZE_DEFAULT, PageInfo, PageRequest};
    pub use crate::query::memory::{KeySelector, MemoryError, MemoryQuery, MemoryStore, Predicate};
    #[cfg(feature = "sqlite")]
    pub use crate::query::sql::{Column, Projection, SqlExpr, SqlQuery, SqlValue};
    pub use crate::query::{LazyQuery, Select, SortKey, SortOrder};
}
