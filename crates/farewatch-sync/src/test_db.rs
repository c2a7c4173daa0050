//! Throwaway Postgres schemas for tests that need `TEST_DATABASE_URL`.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::schema::ensure_schema;

pub(crate) struct TestDb {
    admin: PgPool,
    pub(crate) pool: PgPool,
    schema: String,
}

impl TestDb {
    /// Empty schema with no tables. `None` when `TEST_DATABASE_URL` is unset.
    pub(crate) async fn empty() -> Option<Self> {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set; skipping database test");
            return None;
        };
        let admin = PgPool::connect(&url).await.expect("connect admin pool");
        let schema = format!("fw_test_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin)
            .await
            .expect("create test schema");

        let search_path = format!("SET search_path TO {schema}");
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .after_connect(move |conn, _meta| {
                let sql = search_path.clone();
                Box::pin(async move {
                    sqlx::query(&sql).execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await
            .expect("connect test pool");
        Some(Self {
            admin,
            pool,
            schema,
        })
    }

    /// Schema with every table created.
    pub(crate) async fn with_tables() -> Option<Self> {
        let db = Self::empty().await?;
        ensure_schema(&db.pool).await.expect("create tables");
        Some(db)
    }

    pub(crate) async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .expect("count rows")
    }

    pub(crate) async fn teardown(self) {
        self.pool.close().await;
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.admin)
            .await
            .expect("drop test schema");
    }
}
