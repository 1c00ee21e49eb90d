use anyhow::Context;
use clap::{Parser, Subcommand};
use querypage::prelude::*;
use serde::Serialize;
use sqlx::{FromRow, Sqlite, migrate::MigrateDatabase};
use std::path::Path;

const CATALOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS authors (
    author_ref INTEGER PRIMARY KEY,
    author_name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS books (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    year INTEGER NOT NULL,
    author_id INTEGER REFERENCES authors (author_ref)
);
DELETE FROM books;
DELETE FROM authors;
INSERT INTO authors (author_ref, author_name) VALUES
    (1, 'Ursula K. Le Guin'),
    (2, 'Stanislaw Lem'),
    (3, 'Octavia E. Butler');
INSERT INTO books (title, year, author_id) VALUES
    ('A Wizard of Earthsea', 1968, 1),
    ('The Left Hand of Darkness', 1969, 1),
    ('The Lathe of Heaven', 1971, 1),
    ('The Dispossessed', 1974, 1),
    ('Solaris', 1961, 2),
    ('The Invincible', 1964, 2),
    ('The Cyberiad', 1965, 2),
    ('His Master''s Voice', 1968, 2),
    ('Kindred', 1979, 3),
    ('Dawn', 1987, 3),
    ('Parable of the Sower', 1993, 3),
    ('Parable of the Talents', 1998, 3),
    ('Fledgling', 2005, 3),
    ('The Word for World Is Forest', 1972, 1);
"#;

#[derive(Parser)]
#[command(name = "querypage")]
#[command(about = "Browse a book catalog one page at a time", long_about = None)]
pub struct Cli {
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "sqlite:./db/catalog.db",
        help = "SQLite database URL"
    )]
    pub database_url: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the catalog tables and fill them with sample books.
    Init,

    /// Print one page of books as JSON.
    Books {
        #[arg(short, long, default_value_t = 1, help = "Page number, starting at 1")]
        page: u32,

        #[arg(short, long, default_value_t = PAGE_SIZE_DEFAULT, help = "Rows per page")]
        size: u32,

        #[arg(short, long, help = "Only books whose author name contains this text")]
        author: Option<String>,

        #[arg(long, help = "Only books published in or after this year")]
        since: Option<i64>,

        #[arg(
            short,
            long,
            value_parser = parse_sort_key,
            help = "Sort key as column:asc or column:desc, repeatable"
        )]
        order: Vec<SortKey<Column>>,

        #[arg(long, help = "Project each row to its title only")]
        titles: bool,
    },
}

#[derive(Debug, Serialize, FromRow)]
struct BookRow {
    id: i64,
    title: String,
    year: i64,
    author_name: Option<String>,
}

#[derive(Debug, Serialize, FromRow)]
struct TitleRow {
    title: String,
}

fn parse_sort_key(s: &str) -> Result<SortKey<Column>, String> {
    let (column, order) = match s.split_once(':') {
        Some((column, order)) => (column, order.parse::<SortOrder>()?),
        None => (s, SortOrder::Ascending),
    };

    if column.is_empty() {
        return Err(format!("missing column in `{s}`"));
    }

    Ok(SortKey::new(Column::new(column), order))
}

fn build_filter(author: Option<String>, since: Option<i64>) -> Option<SqlExpr> {
    let by_author = author.map(|name| Column::new("authors.author_name").like(format!("%{name}%")));
    let by_year = since.map(|year| Column::new("books.year").ge(year));

    match (by_author, by_year) {
        (Some(a), Some(b)) => Some(a.and(b)),
        (a, b) => a.or(b),
    }
}

async fn open_catalog(url: &str) -> anyhow::Result<Database> {
    if let Some(path) = url.strip_prefix("sqlite:") {
        let path = path.trim_start_matches("//");
        if !path.starts_with(":memory:") {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
    }

    if !Sqlite::database_exists(url).await.unwrap_or(false) {
        Sqlite::create_database(url)
            .await
            .with_context(|| format!("failed to create database {url}"))?;
    }

    Ok(Database::connect(url).await?)
}

async fn print_page<P>(result: PagedResult<P>) -> anyhow::Result<()>
where
    P: LazyQuery<Error = DatabaseError>,
    P::Item: Serialize,
{
    let rows = result.fetch().await?;
    let info = result.page_info().await?;

    let output = serde_json::json!({
        "page": info,
        "rows": rows,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let db = open_catalog(&cli.database_url).await?;

    match cli.command {
        Commands::Init => {
            db.execute(CATALOG_SCHEMA).await?;
            println!("Seeded catalog at {}", cli.database_url);
        }
        Commands::Books {
            page,
            size,
            author,
            since,
            order,
            titles,
        } => {
            let mut composer = db
                .table::<BookRow>("books")
                .paginate()
                .page(page)
                .size(size)
                .include(|books| books.left_join("authors", "authors.author_ref", "books.author_id"))
                .sort_keys(order);

            if let Some(predicate) = build_filter(author, since) {
                composer = composer.filter(predicate);
            }

            if titles {
                let result = composer.compose_with(Projection::<TitleRow>::of(["books.title"]))?;
                print_page(result).await?;
            } else {
                print_page(composer.compose()?).await?;
            }
        }
    }

    Ok(())
}
