//! PostgreSQL integration tests against a throwaway container.
//!
//! These exercise the native driver end to end: connecting through the
//! factory, transactions and parameters, pooling, caching query results,
//! and the table analyzer over a schema built for the purpose.

#[cfg(feature = "postgresql")]
mod postgres_analysis_tests {
    use sqlanalyzer_core::analyzer::AnalysisStatus;
    use sqlanalyzer_core::cache::{CacheConfig, CacheKeyGenerator};
    use sqlanalyzer_core::connection::QueryRow;
    use sqlanalyzer_core::{
        CacheEntryOptions, ConnectionFactory, ConnectionHandle, ConnectionOptions,
        ConnectionPoolManager, EngineKind, PoolSettings, QueryCache, QueryParam, QueryResult, Result,
        RetryPolicy, Severity, SqlAnalyzerError, analyze_tables,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use testcontainers_modules::{postgres::Postgres, testcontainers::runners::AsyncRunner};

    fn connection_string(port: u16) -> String {
        format!(
            "Host=127.0.0.1;Port={};Database=postgres;Username=postgres;Password=postgres",
            port
        )
    }

    fn test_factory() -> ConnectionFactory {
        let options = ConnectionOptions::default()
            .with_connect_timeout(Duration::from_secs(5))
            .with_command_timeout(Duration::from_secs(30));
        ConnectionFactory::new(options, RetryPolicy::none())
    }

    /// Opens a connection, retrying until the container accepts queries
    async fn wait_for_postgres_ready(
        factory: &ConnectionFactory,
        connection_string: &str,
        max_attempts: u32,
    ) -> Result<ConnectionHandle> {
        let mut attempts = 0;
        loop {
            let mut conn = factory.create_connection(connection_string)?;
            if conn.open().await.is_ok() && conn.test_connection().await.unwrap_or(false) {
                return Ok(conn);
            }
            conn.dispose().await;
            attempts += 1;
            if attempts >= max_attempts {
                return Err(SqlAnalyzerError::connection_failed(
                    "waiting for PostgreSQL",
                    false,
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("PostgreSQL failed to become ready after {} attempts", max_attempts),
                    ),
                ));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn exec(conn: &mut ConnectionHandle, sql: &str) {
        conn.execute_non_query(sql, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_postgres_table_analysis_end_to_end() {
        let postgres = Postgres::default().start().await.unwrap();
        let port = postgres.get_host_port_ipv4(5432).await.unwrap();
        let factory = test_factory();
        let mut conn = wait_for_postgres_ready(&factory, &connection_string(port), 30)
            .await
            .unwrap();

        exec(&mut conn, "CREATE SCHEMA shop").await;
        exec(
            &mut conn,
            "CREATE TABLE shop.customers (id SERIAL PRIMARY KEY, name TEXT NOT NULL)",
        )
        .await;
        exec(&mut conn, "CREATE TABLE shop.tbl_audit (entry TEXT)").await;
        exec(
            &mut conn,
            r#"CREATE TABLE shop."Order-Lines" (id INT PRIMARY KEY, qty INT)"#,
        )
        .await;

        let wide_columns: Vec<String> = (1..=30).map(|i| format!("c{} INT", i)).collect();
        exec(
            &mut conn,
            &format!(
                "CREATE TABLE shop.wide_events (id INT PRIMARY KEY, {})",
                wide_columns.join(", ")
            ),
        )
        .await;
        exec(
            &mut conn,
            "INSERT INTO shop.customers (name) SELECT 'c' || g FROM generate_series(1, 50) g",
        )
        .await;

        let result = analyze_tables(&mut conn, Some("shop".to_string())).await;

        assert!(result.success, "analysis failed: {:?}", result.error_message);
        assert_eq!(result.status, AnalysisStatus::Completed);
        assert_eq!(result.engine, EngineKind::Postgres);
        assert_eq!(result.database.as_deref(), Some("postgres"));
        assert_eq!(result.summary.total_objects_analyzed, 4);

        let critical: Vec<_> = result.findings_with_severity(Severity::Critical).collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].affected_object.as_deref(), Some("shop.tbl_audit"));
        assert_eq!(critical[0].schema.as_deref(), Some("shop"));
        assert!(
            critical[0]
                .remediation_script
                .as_deref()
                .is_some_and(|s| s.contains("PRIMARY KEY"))
        );

        let messages: Vec<&str> = result.findings.iter().map(|f| f.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("wide_events") && m.contains("31 columns")));
        assert!(messages.iter().any(|m| m.contains("Order-Lines") && m.contains("special characters")));
        assert!(messages.iter().any(|m| m.contains("tbl_audit") && m.contains("prefix")));
        assert!(!messages.iter().any(|m| m.contains("heap")));

        conn.dispose().await;
    }

    #[tokio::test]
    async fn test_postgres_connection_lifecycle() {
        let postgres = Postgres::default().start().await.unwrap();
        let port = postgres.get_host_port_ipv4(5432).await.unwrap();
        let factory = test_factory();
        let mut conn = wait_for_postgres_ready(&factory, &connection_string(port), 30)
            .await
            .unwrap();

        let version = conn.get_version().await.unwrap();
        assert!(version.contains("PostgreSQL"), "unexpected version: {}", version);
        assert!(conn.get_size_mb().await.unwrap() > 0.0);

        exec(&mut conn, "CREATE TABLE items (id INT PRIMARY KEY, label TEXT)").await;

        // Committed work is visible, rolled back work is not
        conn.begin_transaction().await.unwrap();
        conn.execute_non_query(
            "INSERT INTO items (id, label) VALUES (@id, @label)",
            &[QueryParam::new("@id", 1_i32), QueryParam::new("label", "kept")],
        )
        .await
        .unwrap();
        conn.commit().await.unwrap();

        conn.begin_transaction().await.unwrap();
        conn.execute_non_query(
            "INSERT INTO items (id, label) VALUES (@id, @label)",
            &[QueryParam::new("id", 2_i32), QueryParam::new("label", "discarded")],
        )
        .await
        .unwrap();
        conn.rollback().await.unwrap();

        let result = conn
            .execute_query("SELECT id, label FROM items ORDER BY id", &[])
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].get_i64("id"), Some(1));
        assert_eq!(result.rows[0].get_str("label"), Some("kept"));

        // Commit without a transaction is a state error
        assert!(matches!(
            conn.commit().await,
            Err(SqlAnalyzerError::InvalidState { .. })
        ));

        conn.dispose().await;
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_postgres_pool_and_cache() {
        let postgres = Postgres::default().start().await.unwrap();
        let port = postgres.get_host_port_ipv4(5432).await.unwrap();
        let cs = connection_string(port);
        let factory = Arc::new(test_factory());
        let mut ready = wait_for_postgres_ready(&factory, &cs, 30).await.unwrap();
        ready.dispose().await;

        let pool = ConnectionPoolManager::new(Arc::clone(&factory));

        let first = pool.acquire(&cs, EngineKind::Postgres).await.unwrap();
        let first_id = first.id();
        let stats = pool.pool_statistics(&cs, EngineKind::Postgres).await;
        assert_eq!(stats.active, 1);
        assert_eq!(stats.available, 0);
        assert!(!stats.connection_string.contains("Password=postgres"));

        pool.release(first).await;
        let stats = pool.pool_statistics(&cs, EngineKind::Postgres).await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.available, 1);

        // The idle connection is handed out again
        let mut reused = pool.acquire(&cs, EngineKind::Postgres).await.unwrap();
        assert_eq!(reused.id(), first_id);

        let cache = QueryCache::new(CacheConfig::default()).unwrap();
        let query = "SELECT COUNT(*) AS total FROM pg_catalog.pg_namespace WHERE nspname = @name";
        let params = [QueryParam::new("name", "public")];
        let params: &[QueryParam] = &params;
        let key = CacheKeyGenerator::for_query(query, params);

        for _ in 0..2 {
            let conn: &mut ConnectionHandle = &mut reused;
            let result: QueryResult = cache
                .get_or_add(
                    &key,
                    || async move { conn.execute_query(query, params).await },
                    CacheEntryOptions::default().with_absolute_expiration(Duration::from_secs(60)),
                )
                .await
                .unwrap();
            let row: &QueryRow = &result.rows[0];
            assert_eq!(row.get_i64("total"), Some(1));
        }

        let cache_stats = cache.statistics().await;
        assert_eq!(cache_stats.total_misses, 1);
        assert_eq!(cache_stats.total_hits, 1);

        pool.release(reused).await;
        assert_eq!(pool.clear_pool(&cs, EngineKind::Postgres).await, 1);
        pool.shutdown().await;
        cache.shutdown();
    }

    #[tokio::test]
    async fn test_postgres_warm_pool_fills_up_to_capacity() {
        let postgres = Postgres::default().start().await.unwrap();
        let port = postgres.get_host_port_ipv4(5432).await.unwrap();
        let cs = connection_string(port);
        let factory = Arc::new(test_factory());
        let mut ready = wait_for_postgres_ready(&factory, &cs, 30).await.unwrap();
        ready.dispose().await;

        let pool = ConnectionPoolManager::new(Arc::clone(&factory))
            .with_settings(PoolSettings::default().with_pool_size(0, 2))
            .unwrap();

        let report = pool.warm_pool(&cs, EngineKind::Postgres, 3).await.unwrap();
        assert_eq!(report.requested, 3);
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 0);
        assert!(report.errors.is_empty());

        // The third connection did not fit and was closed again
        let stats = pool.pool_statistics(&cs, EngineKind::Postgres).await;
        assert_eq!(stats.available, 2);
        assert_eq!(stats.active, 0);

        let conn = pool.acquire(&cs, EngineKind::Postgres).await.unwrap();
        assert!(conn.is_open());
        pool.release(conn).await;
        pool.shutdown().await;
    }
}
