//! HTTP client for the on-chain ownership indexer.

use crate::authority::{AuthorityError, OwnershipAuthority};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::IndexerConfig;
use crate::handle::Handle;
use crate::types::Ownership;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

/// Queries `GET {base_url}/handles/{handle}` on the indexer.
///
/// `200` carries the confirmed ownership, `404` means the handle is not
/// registered. Repeated failures trip a circuit breaker so callers fail fast
/// while the indexer is down.
#[derive(Clone, Debug)]
pub struct IndexerClient {
    client: reqwest::Client,
    base_url: String,
    breaker: CircuitBreaker,
}

impl IndexerClient {
    pub fn new(config: &IndexerConfig) -> Result<Self, AuthorityError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim().to_string(),
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn fetch(&self, handle: &Handle) -> Result<Option<Ownership>, AuthorityError> {
        let url = self.endpoint(&format!("handles/{}", handle.as_str()));
        let response = self.client.get(url).send().await?;

        match response.status() {
            StatusCode::OK => {
                let dto = response.json::<OwnershipResponse>().await?;
                Ok(Some(dto.into_ownership(handle)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(AuthorityError::UnexpectedStatus(status.as_u16())),
        }
    }
}

#[async_trait]
impl OwnershipAuthority for IndexerClient {
    async fn lookup(&self, handle: &Handle) -> Result<Option<Ownership>, AuthorityError> {
        if !self.breaker.can_execute() {
            debug!(handle = %handle, "indexer circuit open, skipping lookup");
            return Err(AuthorityError::CircuitOpen);
        }

        let result = self.fetch(handle).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(err) => {
                warn!(handle = %handle, error = %err, "indexer lookup failed");
                self.breaker.record_failure();
            }
        }
        result
    }
}

#[derive(Debug, Deserialize)]
struct OwnershipResponse {
    #[serde(default)]
    handle: Option<String>,
    owner: String,
    #[serde(alias = "externalName")]
    external_name: String,
}

impl OwnershipResponse {
    fn into_ownership(self, handle: &Handle) -> Ownership {
        Ownership {
            handle: self.handle.unwrap_or_else(|| handle.to_string()),
            owner: self.owner,
            external_name: self.external_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerState};
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use tokio::sync::oneshot;

    /// In-process indexer: `alice` is registered, `broken` fails with 500,
    /// anything else is unknown.
    struct MockIndexer {
        address: String,
        shutdown: Option<oneshot::Sender<()>>,
    }

    impl MockIndexer {
        async fn start() -> Self {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind mock indexer listener");
            let addr = listener.local_addr().expect("listener addr lookup");

            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let app = Router::new().route("/handles/:handle", get(lookup_handle));

            tokio::spawn(async move {
                let server = axum::serve(listener, app);
                let graceful = server.with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                });
                let _ = graceful.await;
            });

            Self {
                address: format!("http://{}/", addr),
                shutdown: Some(shutdown_tx),
            }
        }

        fn address(&self) -> String {
            self.address.clone()
        }
    }

    impl Drop for MockIndexer {
        fn drop(&mut self) {
            if let Some(shutdown) = self.shutdown.take() {
                let _ = shutdown.send(());
            }
        }
    }

    async fn lookup_handle(Path(handle): Path<String>) -> (StatusCode, Json<Value>) {
        match handle.as_str() {
            "alice" => (
                StatusCode::OK,
                Json(json!({
                    "handle": "alice",
                    "owner": "0xA11CE",
                    "externalName": "alice.eth"
                })),
            ),
            "broken" => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))),
            _ => (StatusCode::NOT_FOUND, Json(json!({}))),
        }
    }

    fn client(base_url: String, failure_threshold: u32) -> IndexerClient {
        IndexerClient::new(&IndexerConfig {
            base_url,
            timeout_ms: 2_000,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold,
                half_open_success_threshold: 1,
                recovery_timeout_secs: 600,
            },
        })
        .unwrap()
    }

    #[test]
    fn endpoint_joins_paths() {
        let client = client("http://indexer.local/api/".to_string(), 3);
        assert_eq!(
            client.endpoint("/handles/alice"),
            "http://indexer.local/api/handles/alice"
        );
    }

    #[tokio::test]
    async fn lookup_maps_found_and_missing() {
        let indexer = MockIndexer::start().await;
        let client = client(indexer.address(), 3);

        let alice = Handle::parse("alice").unwrap();
        let ownership = client.lookup(&alice).await.unwrap().unwrap();
        assert_eq!(ownership.owner, "0xA11CE");
        assert_eq!(ownership.external_name, "alice.eth");

        let bob = Handle::parse("bob").unwrap();
        assert_eq!(client.lookup(&bob).await.unwrap(), None);
    }

    #[tokio::test]
    async fn repeated_failures_open_the_circuit() {
        let indexer = MockIndexer::start().await;
        let client = client(indexer.address(), 2);
        let broken = Handle::parse("broken").unwrap();

        for _ in 0..2 {
            assert!(matches!(
                client.lookup(&broken).await,
                Err(AuthorityError::UnexpectedStatus(500))
            ));
        }
        assert_eq!(client.breaker().state(), CircuitBreakerState::Open);

        let alice = Handle::parse("alice").unwrap();
        assert!(matches!(
            client.lookup(&alice).await,
            Err(AuthorityError::CircuitOpen)
        ));
    }

    #[tokio::test]
    async fn unreachable_indexer_is_a_transport_error() {
        let address = {
            let indexer = MockIndexer::start().await;
            indexer.address()
        };
        // give the server a moment to close its listener
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client = client(address, 3);
        let alice = Handle::parse("alice").unwrap();
        assert!(client.lookup(&alice).await.is_err());
    }
}
