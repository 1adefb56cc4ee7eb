//! Provider clients and the resilience gateway
//!
//! Each external bibliographic source implements [`SeriesProvider`], the
//! uniform fetch contract: a returned [`SourceFetch`] with no series and
//! no error means "not found" (a data miss), while a populated `error`
//! signals an operational failure. The [`ProviderGateway`] wraps every
//! registered client with its circuit breaker, the daily quota ledger and
//! the retry policy, so callers never talk to a client directly.

pub mod googlebooks_client;
pub mod isfdb_client;
pub mod openlibrary_client;

pub use googlebooks_client::GoogleBooksClient;
pub use isfdb_client::IsfdbClient;
pub use openlibrary_client::OpenLibraryClient;

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::quota;
use crate::models::{ProviderKind, SourceFetch};
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::retry::{with_retry, RetryPolicy};

/// How to ask a provider for a series
#[derive(Debug, Clone)]
pub enum SeriesQuery {
    /// The provider's own id for the series
    ByExternalId(String),
    /// Search by name, optionally narrowed by author
    ByName {
        name: String,
        author: Option<String>,
    },
}

impl std::fmt::Display for SeriesQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeriesQuery::ByExternalId(id) => write!(f, "id:{}", id),
            SeriesQuery::ByName { name, .. } => write!(f, "name:{}", name),
        }
    }
}

/// Uniform provider fetch contract
#[async_trait]
pub trait SeriesProvider: Send + Sync {
    /// Which provider this client talks to
    fn kind(&self) -> ProviderKind;

    /// Fetch one series. Infrastructure problems are reported inside the
    /// returned [`SourceFetch`], never panicked or thrown, so batch loops
    /// can count and continue.
    async fn fetch_series(&self, query: &SeriesQuery) -> SourceFetch;
}

/// Errors surfaced by the gateway. `CircuitOpen` and `QuotaExhausted` are
/// refusals — the call was never made — which lets waterfall callers fall
/// through to the next provider without mis-attributing a trip.
#[derive(Debug, Error)]
pub enum ProviderCallError {
    #[error("Circuit open for {provider}, retry in {retry_after:?}")]
    CircuitOpen {
        provider: ProviderKind,
        retry_after: Duration,
    },

    #[error("Daily quota exhausted for {provider}")]
    QuotaExhausted { provider: ProviderKind },

    #[error("Provider {provider} failed: {message}")]
    Failed {
        provider: ProviderKind,
        message: String,
    },

    #[error(transparent)]
    Storage(#[from] shelfmark_common::Error),
}

struct ProviderHandle {
    client: Arc<dyn SeriesProvider>,
    breaker: Arc<CircuitBreaker>,
    /// Daily ceiling; None means unmetered
    quota_ceiling: Option<i64>,
}

/// Registry of provider clients plus their resilience state.
///
/// One instance is constructed at startup and shared by the enrichment
/// scheduler and the request-serving path, so both observe the same
/// breaker state and quota ledger.
pub struct ProviderGateway {
    db: SqlitePool,
    retry: RetryPolicy,
    providers: HashMap<ProviderKind, ProviderHandle>,
}

impl ProviderGateway {
    pub fn new(db: SqlitePool, retry: RetryPolicy) -> Self {
        Self {
            db,
            retry,
            providers: HashMap::new(),
        }
    }

    /// Register a client with its breaker and optional daily ceiling
    pub fn register(
        &mut self,
        client: Arc<dyn SeriesProvider>,
        breaker: Arc<CircuitBreaker>,
        quota_ceiling: Option<i64>,
    ) {
        let kind = client.kind();
        self.providers.insert(
            kind,
            ProviderHandle {
                client,
                breaker,
                quota_ceiling,
            },
        );
    }

    /// Breaker for a provider, shared process-wide
    pub fn breaker(&self, kind: ProviderKind) -> Option<&Arc<CircuitBreaker>> {
        self.providers.get(&kind).map(|h| &h.breaker)
    }

    /// Whether a quota-capped provider has used up today's budget.
    /// Unmetered providers never exhaust.
    pub async fn quota_exhausted(&self, kind: ProviderKind) -> shelfmark_common::Result<bool> {
        match self.providers.get(&kind).and_then(|h| h.quota_ceiling) {
            Some(ceiling) => quota::exhausted(&self.db, kind, ceiling).await,
            None => Ok(false),
        }
    }

    /// Fetch a series through the full resilience stack: breaker gate,
    /// quota check-then-increment, retried call, breaker bookkeeping.
    pub async fn fetch(
        &self,
        kind: ProviderKind,
        query: &SeriesQuery,
    ) -> Result<SourceFetch, ProviderCallError> {
        let handle = self
            .providers
            .get(&kind)
            .ok_or_else(|| ProviderCallError::Failed {
                provider: kind,
                message: "provider not registered".to_string(),
            })?;

        if !handle.breaker.allow() {
            let retry_after = handle
                .breaker
                .remaining_cooldown()
                .unwrap_or(Duration::ZERO);
            tracing::debug!(provider = %kind, ?retry_after, "Short-circuiting call, breaker open");
            return Err(ProviderCallError::CircuitOpen {
                provider: kind,
                retry_after,
            });
        }

        if let Some(ceiling) = handle.quota_ceiling {
            if !quota::use_quota(&self.db, kind, 1, ceiling).await? {
                return Err(ProviderCallError::QuotaExhausted { provider: kind });
            }
        }

        let operation = format!("{}:{}", kind, query);
        let client = Arc::clone(&handle.client);
        let result: Result<SourceFetch, String> =
            with_retry(&operation, &self.retry, |_| true, || {
                let client = Arc::clone(&client);
                let query = query.clone();
                async move {
                    let fetch = client.fetch_series(&query).await;
                    match &fetch.error {
                        Some(message) => Err(message.clone()),
                        None => Ok(fetch),
                    }
                }
            })
            .await;

        match result {
            Ok(fetch) => {
                // Data misses land here too: the provider is up.
                handle.breaker.record_success();
                Ok(fetch)
            }
            Err(message) => {
                handle.breaker.record_failure();
                tracing::warn!(provider = %kind, error = %message, "Provider call failed");
                Err(ProviderCallError::Failed {
                    provider: kind,
                    message,
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted provider stub shared by service tests

    use super::*;
    use crate::models::SourceSeries;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted responses keyed by query display string; anything not
    /// scripted is a data miss.
    pub struct ScriptedProvider {
        kind: ProviderKind,
        responses: Mutex<HashMap<String, SourceFetch>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedProvider {
        pub fn new(kind: ProviderKind) -> Self {
            Self {
                kind,
                responses: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn script_found(&self, key: &str, series: SourceSeries) {
            self.responses
                .lock()
                .unwrap()
                .insert(key.to_string(), SourceFetch::found(series, "{}"));
        }

        pub fn script_failure(&self, key: &str, message: &str) {
            self.responses
                .lock()
                .unwrap()
                .insert(key.to_string(), SourceFetch::failed(message));
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SeriesProvider for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn fetch_series(&self, query: &SeriesQuery) -> SourceFetch {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .get(&query.to_string())
                .cloned()
                .unwrap_or_else(|| SourceFetch::miss(None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedProvider;
    use super::*;
    use crate::db::test_pool;
    use crate::models::SourceSeries;
    use crate::services::circuit_breaker::CircuitBreakerConfig;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    fn tight_breaker() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            base_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            cooldown_multiplier: 2.0,
        }
    }

    fn sample_series(kind: ProviderKind) -> SourceSeries {
        SourceSeries {
            provider: kind,
            external_id: Some("99".to_string()),
            name: "Cradle".to_string(),
            author: None,
            description: None,
            books: Vec::new(),
            sub_series: Vec::new(),
            parent: None,
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_fetch_found_records_success() {
        let pool = test_pool().await;
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::OpenLibrary));
        provider.script_found("name:Cradle", sample_series(ProviderKind::OpenLibrary));

        let breaker = Arc::new(CircuitBreaker::new("openlibrary", tight_breaker()));
        let mut gateway = ProviderGateway::new(pool, fast_retry());
        gateway.register(provider.clone(), breaker, None);

        let query = SeriesQuery::ByName {
            name: "Cradle".to_string(),
            author: None,
        };
        let fetch = gateway
            .fetch(ProviderKind::OpenLibrary, &query)
            .await
            .unwrap();
        assert!(fetch.series.is_some());
    }

    #[tokio::test]
    async fn test_data_miss_does_not_trip_breaker() {
        let pool = test_pool().await;
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::OpenLibrary));
        let breaker = Arc::new(CircuitBreaker::new("openlibrary", tight_breaker()));
        let mut gateway = ProviderGateway::new(pool, fast_retry());
        gateway.register(provider.clone(), breaker.clone(), None);

        let query = SeriesQuery::ByName {
            name: "Nonexistent".to_string(),
            author: None,
        };
        for _ in 0..10 {
            let fetch = gateway
                .fetch(ProviderKind::OpenLibrary, &query)
                .await
                .unwrap();
            assert!(fetch.is_miss());
        }

        assert!(breaker.allow());
    }

    #[tokio::test]
    async fn test_failures_trip_breaker_and_short_circuit() {
        let pool = test_pool().await;
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::OpenLibrary));
        provider.script_failure("name:Cradle", "connection reset");

        let breaker = Arc::new(CircuitBreaker::new("openlibrary", tight_breaker()));
        let mut gateway = ProviderGateway::new(pool, fast_retry());
        gateway.register(provider.clone(), breaker, None);

        let query = SeriesQuery::ByName {
            name: "Cradle".to_string(),
            author: None,
        };

        // Two failed logical calls reach the threshold
        for _ in 0..2 {
            let err = gateway
                .fetch(ProviderKind::OpenLibrary, &query)
                .await
                .unwrap_err();
            assert!(matches!(err, ProviderCallError::Failed { .. }));
        }
        let calls_before = provider.call_count();

        // Third call is refused without touching the client
        let err = gateway
            .fetch(ProviderKind::OpenLibrary, &query)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderCallError::CircuitOpen { .. }));
        assert_eq!(provider.call_count(), calls_before);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_refuses_before_calling() {
        let pool = test_pool().await;
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::GoogleBooks));
        let breaker = Arc::new(CircuitBreaker::new("googlebooks", tight_breaker()));
        let mut gateway = ProviderGateway::new(pool, fast_retry());
        gateway.register(provider.clone(), breaker, Some(2));

        let query = SeriesQuery::ByName {
            name: "Cradle".to_string(),
            author: None,
        };

        assert!(gateway.fetch(ProviderKind::GoogleBooks, &query).await.is_ok());
        assert!(gateway.fetch(ProviderKind::GoogleBooks, &query).await.is_ok());
        assert!(!gateway
            .quota_exhausted(ProviderKind::OpenLibrary)
            .await
            .unwrap());
        assert!(gateway
            .quota_exhausted(ProviderKind::GoogleBooks)
            .await
            .unwrap());

        let err = gateway
            .fetch(ProviderKind::GoogleBooks, &query)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderCallError::QuotaExhausted { .. }));
        assert_eq!(provider.call_count(), 2);
    }
}
