//! Manifest fetches under the upstream's circuit breaker
//!
//! Classification talks to the same hosts relay sessions do. Fetches are
//! refused while the host's breaker is open and their outcomes feed the
//! breaker, so a dead host fails classification as fast as it fails a start.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::services::circuit_breaker_manager::CircuitBreakerManager;
use crate::streaming::classification::{ClassificationError, FetchedManifest, ManifestFetcher};
use crate::utils::circuit_breaker::CallOutcome;
use crate::utils::url::UrlUtils;

pub struct BreakerManifestFetcher {
    inner: Arc<dyn ManifestFetcher>,
    circuit_breakers: CircuitBreakerManager,
}

impl BreakerManifestFetcher {
    pub fn new(inner: Arc<dyn ManifestFetcher>, circuit_breakers: CircuitBreakerManager) -> Self {
        Self {
            inner,
            circuit_breakers,
        }
    }
}

#[async_trait]
impl ManifestFetcher for BreakerManifestFetcher {
    async fn fetch_manifest(
        &self,
        url: &str,
        max_bytes: usize,
    ) -> Result<FetchedManifest, ClassificationError> {
        let breaker = self.circuit_breakers.get_for_url(url);
        // no permit: a half-open trial slot belongs to the relay start
        if let Err(open) = breaker.check_not_open() {
            debug!(url = %UrlUtils::redact(url), service = %open.service, "Manifest fetch skipped, circuit open");
            return Err(ClassificationError::CircuitOpen {
                url: url.to_string(),
                service: open.service,
            });
        }

        let result = self.inner.fetch_manifest(url, max_bytes).await;
        breaker.record_outcome(match &result {
            Ok(_) => CallOutcome::Success,
            Err(ClassificationError::Status { status, .. }) => CallOutcome::Status(*status),
            Err(e) => CallOutcome::Failure(e.to_string()),
        });
        result
    }
}
