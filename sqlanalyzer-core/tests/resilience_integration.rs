//! Failure handling against an unreachable server.
//!
//! Nothing listens on port 1 of the loopback interface, so every connect
//! attempt fails fast with a refused connection. No container is needed.

#[cfg(feature = "postgresql")]
mod resilience_integration_tests {
    use sqlanalyzer_core::resilience::{
        CircuitBreakerOptions, CircuitState, execute_resilient,
    };
    use sqlanalyzer_core::{
        CircuitBreakerRegistry, ConnectionFactory, ConnectionOptions, ConnectionPoolManager,
        EngineKind, RetryPolicy, SqlAnalyzerError,
    };
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const UNREACHABLE: &str =
        "Host=127.0.0.1;Port=1;Database=app;Username=app;Password=Zq8!wT3#pLm";

    fn short_timeouts() -> ConnectionOptions {
        ConnectionOptions::default().with_connect_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient_and_redacted() {
        let factory = ConnectionFactory::new(short_timeouts(), RetryPolicy::none());
        let mut conn = factory.create_connection(UNREACHABLE).unwrap();

        let err = conn.open().await.unwrap_err();
        assert!(err.is_transient(), "refused connect should be transient: {err}");
        assert!(!err.to_string().contains("Zq8!wT3#pLm"));
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_integration_breaker_opens_after_repeated_failures() {
        let factory = ConnectionFactory::new(short_timeouts(), RetryPolicy::none());
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerOptions::default()
                .with_failure_threshold(2)
                .with_open_duration(Duration::from_secs(60)),
        )
        .unwrap();
        let breaker = registry.get_or_create("pg-unreachable", None).await.unwrap();
        let retry = RetryPolicy::default()
            .with_max_retries(1)
            .with_base_delay(Duration::from_millis(10));
        let attempts = AtomicU32::new(0);

        for _ in 0..2 {
            let outcome = execute_resilient(&breaker, &retry, "open connection", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                let handle = factory.create_connection(UNREACHABLE);
                async move {
                    let mut conn = handle?;
                    conn.open().await?;
                    Ok::<_, SqlAnalyzerError>(conn)
                }
            })
            .await;
            assert!(outcome.is_err());
        }

        // One initial attempt plus one retry per call
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected = execute_resilient(&breaker, &retry, "open connection", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert!(matches!(rejected, Err(SqlAnalyzerError::CircuitOpen { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        let stats = registry.statistics().await;
        assert_eq!(stats.open_circuits, 1);

        registry.reset_all().await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_integration_pool_surfaces_connect_failure() {
        let factory = Arc::new(ConnectionFactory::new(short_timeouts(), RetryPolicy::none()));
        let pool = ConnectionPoolManager::new(factory);

        let err = pool.acquire(UNREACHABLE, EngineKind::Postgres).await.unwrap_err();
        assert!(matches!(err, SqlAnalyzerError::Connection { .. }));

        let stats = pool.pool_statistics(UNREACHABLE, EngineKind::Postgres).await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.created, 0);

        pool.shutdown().await;
        assert!(matches!(
            pool.acquire(UNREACHABLE, EngineKind::Postgres).await,
            Err(SqlAnalyzerError::InvalidState { .. })
        ));
    }
}
