//! PostgreSQL operations, organized by relation (spec §3, §4.B).
//!
//! Queries here use `sqlx::query`/`query_as` (runtime-checked) rather than the
//! `query!`/`query_as!` macros: the schema is partition-driven by whatever
//! components an application registers at runtime, so there is no static
//! `DATABASE_URL`/offline cache a macro could check against at compile time.

pub mod component;
pub mod ddl;
pub mod entity;

#[cfg(test)]
pub mod tests {
    use sqlx::PgPool;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    /// Creates an isolated, migrated test database, mirroring the teacher's
    /// `sql::tests::setup_test_db` (unique name per invocation, base schema
    /// applied, connection pool returned).
    pub async fn setup_test_db() -> PgPool {
        let base_url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/entitydb_test".to_string());

        let pid = std::process::id();
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let db_name = format!("entitydb_test_{pid}_{timestamp}_{counter}");

        let mut parsed_url = url::Url::parse(&base_url).expect("invalid TEST_DATABASE_URL");
        let admin_pool = PgPool::connect(&base_url)
            .await
            .expect("failed to connect to admin database");

        sqlx::query(&format!("CREATE DATABASE {db_name}"))
            .execute(&admin_pool)
            .await
            .expect("failed to create test database");
        admin_pool.close().await;

        parsed_url.set_path(&format!("/{db_name}"));
        let pool = PgPool::connect(parsed_url.as_str())
            .await
            .expect("failed to connect to test database");

        super::ddl::initialize_base_schema(
            &pool,
            crate::config::PartitionStrategy::List,
            16,
        )
        .await
        .expect("failed to initialize schema");

        pool
    }
}
