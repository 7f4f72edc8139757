//! Paged record reads from a form table (the record-access boundary).

use std::collections::HashSet;

use sqlx::Row;
use tracing::debug;

use crate::error::{DbError, Result};
use crate::sql_guard::{quote_ident, quote_literal};
use crate::types::*;
use crate::{Db, Dialect, FormDb};

type DbQuery<'q> = sqlx::query::Query<'q, Db, <Db as sqlx::Database>::Arguments<'q>>;

const SOFT_DELETE_COLUMN: &str = "_deleted";

impl FormDb {
    /// Read one page of rows as JSON objects, newest first.
    ///
    /// Filter columns must exist on the table; values are bound, never
    /// interpolated. Soft-deleted rows are skipped unless asked for.
    pub async fn query_table(
        &self,
        table: &str,
        query: &TableQuery,
        pagination: Pagination,
    ) -> Result<RecordPage> {
        let columns = self.table_columns(table).await?;
        if columns.is_empty() {
            return Err(DbError::not_found(format!("table {}", table)));
        }
        let known: HashSet<&str> = columns.iter().map(String::as_str).collect();

        let mut predicates = Vec::new();
        let mut binds = Vec::new();
        for (column, value) in &query.filters {
            if !known.contains(column.as_str()) {
                return Err(DbError::invalid_input(format!(
                    "table {} has no column '{}'",
                    table, column
                )));
            }
            if *value == DbValue::Null {
                predicates.push(format!("{} IS NULL", quote_ident(column)));
            } else {
                binds.push(value.clone());
                predicates.push(format!("{} = ${}", quote_ident(column), binds.len()));
            }
        }
        if !query.include_deleted && known.contains(SOFT_DELETE_COLUMN) {
            predicates.push(format!("{} = false", quote_ident(SOFT_DELETE_COLUMN)));
        }
        let where_clause = if predicates.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", predicates.join(" AND "))
        };

        let table_ident = quote_ident(table);
        let count_sql = format!("SELECT COUNT(*) AS total FROM {table_ident}{where_clause}");
        let mut count_query = sqlx::query(&count_sql);
        for value in &binds {
            count_query = bind_value(count_query, value);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.try_get("total")?;
        let total = total.max(0) as u64;

        let pagination = pagination.normalized();
        let order = order_clause(&known);
        let limit_at = binds.len() + 1;
        let select_sql = match self.dialect {
            Dialect::Postgres => format!(
                "SELECT to_jsonb(t)::text AS record FROM {table_ident} t{where_clause}{order} \
                 LIMIT ${} OFFSET ${}",
                limit_at,
                limit_at + 1
            ),
            Dialect::Sqlite => format!(
                "SELECT {} AS record FROM {table_ident}{where_clause}{order} LIMIT ${} OFFSET ${}",
                sqlite_json_object(&columns)?,
                limit_at,
                limit_at + 1
            ),
        };
        debug!(table, sql = %select_sql, "Querying records");

        let mut select = sqlx::query(&select_sql);
        for value in &binds {
            select = bind_value(select, value);
        }
        let rows = select
            .bind(pagination.page_size as i64)
            .bind(pagination.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        let rows = rows
            .iter()
            .map(|row| -> Result<serde_json::Value> {
                let text: String = row.try_get("record")?;
                Ok(serde_json::from_str(&text)?)
            })
            .collect::<Result<Vec<_>>>()?;

        let page_size = pagination.page_size as u64;
        Ok(RecordPage {
            rows,
            page: pagination.page,
            page_size: pagination.page_size,
            total,
            total_pages: total.div_ceil(page_size),
        })
    }

    /// Number of rows in a table, soft-deleted rows included.
    pub async fn count_rows(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) AS total FROM {}", quote_ident(table));
        let total: i64 = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;
        Ok(total.max(0) as u64)
    }
}

fn order_clause(known: &HashSet<&str>) -> String {
    match (known.contains("created_at"), known.contains("id")) {
        (true, true) => " ORDER BY \"created_at\" DESC, \"id\"".to_string(),
        (true, false) => " ORDER BY \"created_at\" DESC".to_string(),
        (false, true) => " ORDER BY \"id\"".to_string(),
        (false, false) => String::new(),
    }
}

fn sqlite_json_object(columns: &[String]) -> Result<String> {
    let pairs = columns
        .iter()
        .map(|c| -> Result<String> { Ok(format!("{}, {}", quote_literal(c)?, quote_ident(c))) })
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("json_object({})", pairs.join(", ")))
}

fn bind_value<'q>(query: DbQuery<'q>, value: &DbValue) -> DbQuery<'q> {
    match value {
        DbValue::Null => query.bind(None::<String>),
        DbValue::Boolean(v) => query.bind(*v),
        DbValue::Integer(v) => query.bind(*v),
        DbValue::Real(v) => query.bind(*v),
        DbValue::Text(v) => query.bind(v.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> FormDb {
        let db = FormDb::open_in_memory().await.unwrap();
        db.execute_ddl(&[
            "CREATE TABLE \"people\" (\"id\" text PRIMARY KEY, \"created_at\" text NOT NULL, \
             \"name\" text, \"age\" integer, \"_deleted\" boolean NOT NULL DEFAULT false)"
                .to_string(),
        ])
        .await
        .unwrap();
        for (i, (name, age, deleted)) in [
            ("ada", 36, false),
            ("bob", 41, false),
            ("cyd", 36, true),
            ("dee", 29, false),
        ]
        .into_iter()
        .enumerate()
        {
            sqlx::query(
                "INSERT INTO \"people\" (\"id\", \"created_at\", \"name\", \"age\", \"_deleted\") \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(format!("p{}", i))
            .bind(format!("2024-01-0{}T00:00:00.000Z", i + 1))
            .bind(name)
            .bind(age)
            .bind(deleted)
            .execute(db.pool())
            .await
            .unwrap();
        }
        db
    }

    #[tokio::test]
    async fn test_query_table_pages_newest_first() {
        let db = seeded().await;
        let page = db
            .query_table("people", &TableQuery::new(), Pagination::new(1, 2))
            .await
            .unwrap();

        assert_eq!(page.total, 3);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.rows[0]["name"], "dee");
        assert_eq!(page.rows[1]["name"], "bob");

        let page2 = db
            .query_table("people", &TableQuery::new(), Pagination::new(2, 2))
            .await
            .unwrap();
        assert_eq!(page2.rows.len(), 1);
        assert_eq!(page2.rows[0]["name"], "ada");
    }

    #[tokio::test]
    async fn test_query_table_filters_and_soft_delete() {
        let db = seeded().await;
        let q = TableQuery::new().filter("age", 36);
        let page = db.query_table("people", &q, Pagination::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.rows[0]["name"], "ada");

        let q = TableQuery::new().filter("age", 36).include_deleted(true);
        let page = db.query_table("people", &q, Pagination::default()).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(db.count_rows("people").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_query_table_rejects_unknown_column() {
        let db = seeded().await;
        let q = TableQuery::new().filter("name\" OR 1=1 --", "x");
        let err = db.query_table("people", &q, Pagination::default()).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidInput(_)));

        let err = db
            .query_table("nobody", &TableQuery::new(), Pagination::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }
}
