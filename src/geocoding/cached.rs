// src/geocoding/cached.rs
//
// Store-backed cache, rate limit and retry around any `Geocoder`. The cache is
// keyed by the SHA-256 of the normalized address so "123 Main St" and
// "123 main street" share one external lookup.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};
use rand::Rng;
use sha2::{Digest, Sha256};

use super::{GeocodeResult, Geocoder, HttpGeocoder};
use crate::error::{EngineError, EngineResult, GeocodeError};
use crate::extraction::normalize_address;
use crate::store::{CachedGeocode, SharedStore};
use crate::utils::env::env_parse;

#[derive(Debug, Clone, PartialEq)]
pub struct GeocoderSettings {
    /// Unset disables geocoding; places then match on address text only.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub requests_per_second: u32,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub timeout: Duration,
}

impl Default for GeocoderSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            requests_per_second: 10,
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(10),
        }
    }
}

impl GeocoderSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("GEOCODER_URL").ok().filter(|v| !v.trim().is_empty()),
            api_key: std::env::var("GEOCODER_API_KEY").ok().filter(|v| !v.trim().is_empty()),
            requests_per_second: env_parse("GEOCODER_RATE_PER_SECOND", defaults.requests_per_second),
            max_attempts: env_parse("GEOCODER_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            base_backoff: Duration::from_millis(env_parse("GEOCODER_BACKOFF_MS", 500u64)),
            timeout: Duration::from_secs(env_parse("GEOCODER_TIMEOUT_SECS", 10u64)),
        }
    }

    /// Builds the HTTP-backed geocoder, or None when no endpoint is configured.
    pub fn build(&self, store: SharedStore) -> Result<Option<CachedGeocoder>> {
        let url = match &self.base_url {
            Some(url) => url.clone(),
            None => {
                info!("GEOCODER_URL not set; place records will not be geocoded");
                return Ok(None);
            }
        };
        let http = HttpGeocoder::new(url, self.api_key.clone(), self.timeout)?;
        Ok(Some(CachedGeocoder::new(store, Arc::new(http), self.clone())))
    }
}

pub fn cache_key(normalized_address: &str) -> String {
    hex::encode(Sha256::digest(normalized_address.as_bytes()))
}

pub struct CachedGeocoder {
    store: SharedStore,
    inner: Arc<dyn Geocoder>,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    settings: GeocoderSettings,
}

impl CachedGeocoder {
    pub fn new(store: SharedStore, inner: Arc<dyn Geocoder>, settings: GeocoderSettings) -> Self {
        let rate = NonZeroU32::new(settings.requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            store,
            inner,
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            settings,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.base_backoff.as_millis() as u64;
        let exponential = base.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
        let jitter = if base > 1 { rand::thread_rng().gen_range(0..base / 2 + 1) } else { 0 };
        Duration::from_millis(exponential + jitter)
    }

    /// Geocodes `address`, answering from the cache when possible. A cached
    /// "no result" is a hit too.
    pub async fn geocode(&self, address: &str) -> EngineResult<Option<GeocodeResult>> {
        let normalized = normalize_address(address);
        if normalized.is_empty() {
            return Ok(None);
        }
        let key = cache_key(&normalized);
        if let Some(hit) = self.store.cached_geocode(&key).await? {
            debug!("Geocode cache hit for '{}'", normalized);
            return Ok(hit.result);
        }

        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.until_ready().await;
            match self.inner.geocode(address).await {
                Ok(result) => {
                    self.store
                        .put_cached_geocode(CachedGeocode {
                            cache_key: key,
                            normalized_address: normalized,
                            result: result.clone(),
                            cached_at: Utc::now(),
                        })
                        .await?;
                    return Ok(result);
                }
                Err(GeocodeError::Permanent(message)) => {
                    warn!("⚠️ Geocoding '{}' failed permanently: {}", address, message);
                    return Err(EngineError::GeocodingFailed { attempts: attempt, message });
                }
                Err(GeocodeError::Transient { message, retry_after }) => {
                    if attempt >= max_attempts {
                        warn!(
                            "⚠️ Geocoding '{}' failed after {} attempt(s): {}",
                            address, attempt, message
                        );
                        return Err(EngineError::GeocodingFailed { attempts: attempt, message });
                    }
                    let wait = retry_after.unwrap_or_else(|| self.backoff(attempt));
                    debug!(
                        "Geocoder transient error ({}), retrying in {:?} (attempt {}/{})",
                        message, wait, attempt, max_attempts
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::store::MemoryStore;

    struct CountingGeocoder {
        calls: AtomicUsize,
        transient_failures: usize,
        answer: Option<GeocodeResult>,
    }

    #[async_trait]
    impl Geocoder for CountingGeocoder {
        async fn geocode(&self, _address: &str) -> Result<Option<GeocodeResult>, GeocodeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.transient_failures {
                return Err(GeocodeError::Transient {
                    message: "503".into(),
                    retry_after: None,
                });
            }
            Ok(self.answer.clone())
        }
    }

    fn settings() -> GeocoderSettings {
        GeocoderSettings {
            requests_per_second: 1000,
            base_backoff: Duration::from_millis(1),
            ..GeocoderSettings::default()
        }
    }

    fn fake(transient_failures: usize, answer: Option<GeocodeResult>) -> Arc<CountingGeocoder> {
        Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            transient_failures,
            answer,
        })
    }

    #[tokio::test]
    async fn test_cache_hit_skips_the_service() {
        let store = Arc::new(MemoryStore::new());
        let answer = GeocodeResult {
            formatted_address: "123 Main St, Santa Rosa, CA".into(),
            latitude: 38.44,
            longitude: -122.71,
            place_key: Some("p1".into()),
        };
        let inner = fake(0, Some(answer.clone()));
        let geocoder = CachedGeocoder::new(store.clone(), inner.clone(), settings());

        assert_eq!(geocoder.geocode("123 Main St").await.unwrap(), Some(answer.clone()));
        // Same normalized text, different spelling.
        assert_eq!(geocoder.geocode("123 MAIN STREET").await.unwrap(), Some(answer));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.geocode_cache_len().await, 1);
    }

    #[tokio::test]
    async fn test_no_result_is_cached() {
        let store = Arc::new(MemoryStore::new());
        let inner = fake(0, None);
        let geocoder = CachedGeocoder::new(store, inner.clone(), settings());
        assert_eq!(geocoder.geocode("nowhere lane").await.unwrap(), None);
        assert_eq!(geocoder.geocode("nowhere lane").await.unwrap(), None);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_give_up() {
        let store = Arc::new(MemoryStore::new());
        let recovering = fake(2, None);
        let geocoder = CachedGeocoder::new(store.clone(), recovering.clone(), settings());
        assert_eq!(geocoder.geocode("1 Elm St").await.unwrap(), None);
        assert_eq!(recovering.calls.load(Ordering::SeqCst), 3);

        let failing = fake(usize::MAX, None);
        let geocoder = CachedGeocoder::new(store.clone(), failing.clone(), settings());
        match geocoder.geocode("2 Elm St").await {
            Err(EngineError::GeocodingFailed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected geocoding failure, got {:?}", other),
        }
        // Failures are not cached.
        assert_eq!(store.geocode_cache_len().await, 1);
    }

    #[test]
    fn test_cache_key_is_hex_sha256() {
        let key = cache_key("123 main street");
        assert_eq!(key.len(), 64);
        assert_eq!(key, cache_key("123 main street"));
        assert_ne!(key, cache_key("124 main street"));
    }
}
