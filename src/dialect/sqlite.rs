use super::Dialect;

/// SQLite dialect implementation of the `Dialect` trait.
#[cfg(feature = "sqlite")]
pub struct SqliteDialect;

#[cfg(feature = "sqlite")]
impl Dialect for SqliteDialect {
    fn placeholder(_idx: usize) -> String {
        "?".to_string()
    }

    /// SQLite rejects `OFFSET` without `LIMIT`, so an unbounded `LIMIT -1` is emitted.
    fn window_clause(limit: Option<usize>, offset: Option<usize>) -> String {
        match (limit, offset) {
            (None, Some(offset)) => format!(" LIMIT -1 OFFSET {}", Self::placeholder(offset)),
            (Some(limit), Some(offset)) => format!(
                " LIMIT {} OFFSET {}",
                Self::placeholder(limit),
                Self::placeholder(offset)
            ),
            (Some(limit), None) => format!(" LIMIT {}", Self::placeholder(limit)),
            (None, None) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SqliteDialect;
    use crate::dialect::Dialect;

    #[test]
    fn test_quote_identifier() {
        assert_eq!("\"books\"", SqliteDialect::quote_identifier("books"));
        assert_eq!(
            "\"books\".\"title\"",
            SqliteDialect::quote_identifier("books.title")
        );
        assert_eq!(
            "\"a\"\"b\"",
            SqliteDialect::quote_identifier("a\"b")
        );
    }

    #[test]
    fn test_window_clause() {
        assert_eq!("", SqliteDialect::window_clause(None, None));
        assert_eq!(" LIMIT ?", SqliteDialect::window_clause(Some(1), None));
        assert_eq!(
            " LIMIT ? OFFSET ?",
            SqliteDialect::window_clause(Some(1), Some(2))
        );
        assert_eq!(
            " LIMIT -1 OFFSET ?",
            SqliteDialect::window_clause(None, Some(1))
        );
    }

    #[test]
    fn test_count_statement() {
        assert_eq!(
            "SELECT COUNT(*) FROM (SELECT * FROM \"books\") AS counted",
            SqliteDialect::count_statement("SELECT * FROM \"books\"")
        );
    }
}
