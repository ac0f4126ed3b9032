//! # Adaptive response cache
//!
//! Maps a stable fingerprint of `(prompt type, composed prompt, variant,
//! context factors)` to a previously generated response. TTL is adaptive:
//! `base_ttl(prompt_type) × Π context_multiplier(factor)`, floored at a
//! configured minimum so volatile contexts cannot thrash the cache. Factors
//! signalling real-time volatility (an active alert) multiply below 1.0;
//! factors signalling stability (historical data) multiply above it.
//!
//! Entries are never updated in place; expiry forces a fresh generation.
//!
//! [AdaptiveCache::get_or_generate] adds single-flight semantics: concurrent
//! callers with the same fingerprint collapse into one model invocation and
//! all receive the first call's result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell, RwLock};

use crate::llm::errors::GenerateError;
use crate::utils::hashing::sha256_hex;

/// TTL floor applied after all multipliers.
const DEFAULT_MIN_TTL: Duration = Duration::from_secs(60);
/// Base TTL for prompt types without an explicit entry.
const DEFAULT_BASE_TTL: Duration = Duration::from_secs(600);

/// A cached generation plus the metadata a live call would have produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub content: String,
    pub model: String,
    pub tokens: u32,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedResponse,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: CachedResponse, ttl: Duration) -> Self {
        Self { value, expires_at: Instant::now() + ttl }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// TTL policy: base TTL per prompt type and a multiplier per context factor.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    base_ttls: HashMap<String, Duration>,
    default_base: Duration,
    multipliers: HashMap<String, f64>,
    min_ttl: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        let base_ttls = HashMap::from([
            ("general_chat".to_string(), Duration::from_secs(1800)),
            ("infrastructure_monitoring".to_string(), Duration::from_secs(300)),
            ("troubleshooting".to_string(), Duration::from_secs(300)),
            ("cost_analysis".to_string(), Duration::from_secs(3600)),
            ("resource_analysis".to_string(), Duration::from_secs(1200)),
        ]);
        let multipliers = HashMap::from([
            ("alert_active".to_string(), 0.5),
            ("realtime_metrics".to_string(), 0.6),
            ("historical".to_string(), 2.0),
            ("static_inventory".to_string(), 1.5),
        ]);
        Self {
            base_ttls,
            default_base: DEFAULT_BASE_TTL,
            multipliers,
            min_ttl: DEFAULT_MIN_TTL,
        }
    }
}

impl TtlPolicy {
    pub fn new(
        base_ttls: HashMap<String, Duration>,
        default_base: Duration,
        multipliers: HashMap<String, f64>,
        min_ttl: Duration,
    ) -> Self {
        Self { base_ttls, default_base, multipliers, min_ttl }
    }

    /// Compute the TTL for a prompt type under the given context factors.
    /// Unknown factors are ignored; the result never drops below the floor.
    pub fn ttl_for(&self, prompt_type: &str, factors: &[&str]) -> Duration {
        let base = self
            .base_ttls
            .get(prompt_type)
            .copied()
            .unwrap_or(self.default_base);
        let multiplier: f64 = factors
            .iter()
            .filter_map(|factor| self.multipliers.get(*factor))
            .product();
        let scaled = base.mul_f64(multiplier);
        scaled.max(self.min_ttl)
    }
}

/// Stable cache fingerprint over everything that shaped the prompt: the
/// prompt type, the composed prompt text itself (composition is
/// deterministic, so it captures the task, bound variables, context, and
/// history), the assigned experiment variant, and the context factors.
/// Factors are sorted so their order never matters.
pub fn fingerprint(
    prompt_type: &str,
    prompt: &str,
    variant: Option<&str>,
    factors: &[&str],
) -> String {
    let mut parts: Vec<String> = vec![prompt_type.to_string(), prompt.to_string()];
    if let Some(variant) = variant {
        parts.push(format!("variant:{}", variant));
    }
    let mut sorted_factors: Vec<&str> = factors.to_vec();
    sorted_factors.sort_unstable();
    for factor in sorted_factors {
        parts.push(format!("factor:{}", factor));
    }
    let part_refs: Vec<&str> = parts.iter().map(String::as_str).collect();
    sha256_hex(&part_refs)
}

type InflightMap = HashMap<String, Arc<OnceCell<CachedResponse>>>;

/// Shared response cache with adaptive TTLs and single-flight generation.
pub struct AdaptiveCache {
    store: RwLock<HashMap<String, CacheEntry>>,
    inflight: Mutex<InflightMap>,
    policy: TtlPolicy,
}

impl AdaptiveCache {
    pub fn new(policy: TtlPolicy) -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    /// Look up a fingerprint. Expired entries are pruned and reported as
    /// misses.
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        {
            let store = self.store.read().await;
            match store.get(key) {
                Some(entry) if !entry.is_expired() => {
                    debug!("cache hit: {}", key);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: prune under the write lock, re-checking first.
        let mut store = self.store.write().await;
        if store.get(key).is_some_and(|entry| entry.is_expired()) {
            store.remove(key);
        }
        None
    }

    /// Store a response under the policy-computed TTL.
    pub async fn put(&self, key: &str, value: CachedResponse, prompt_type: &str, factors: &[&str]) {
        let ttl = self.policy.ttl_for(prompt_type, factors);
        self.put_with_ttl(key, value, ttl).await;
    }

    /// Store a response under an explicit TTL.
    pub async fn put_with_ttl(&self, key: &str, value: CachedResponse, ttl: Duration) {
        let mut store = self.store.write().await;
        store.retain(|_, entry| !entry.is_expired());
        debug!("cache put: {} (ttl = {:?})", key, ttl);
        store.insert(key.to_string(), CacheEntry::new(value, ttl));
    }

    /// Fetch from cache, or generate, with at most one in-flight generation
    /// per fingerprint. Returns the response and whether it came from cache.
    /// Concurrent callers with the same key await the first call's result.
    pub async fn get_or_generate<F, Fut>(
        &self,
        key: &str,
        prompt_type: &str,
        factors: &[&str],
        generate: F,
    ) -> Result<(CachedResponse, bool), GenerateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse, GenerateError>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok((hit, true));
        }

        let cell = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let mut ran_generator = false;
        let result = cell
            .get_or_try_init(|| {
                ran_generator = true;
                generate()
            })
            .await
            .cloned();

        match result {
            Ok(value) => {
                if ran_generator {
                    // The task that generated publishes to the cache and
                    // retires the in-flight cell.
                    self.put(key, value.clone(), prompt_type, factors).await;
                    self.inflight.lock().await.remove(key);
                }
                Ok((value, false))
            }
            Err(err) => {
                // Drop the failed cell so a later request can retry.
                self.inflight.lock().await.remove(key);
                Err(err)
            }
        }
    }

    /// Number of live (non-expired) entries.
    pub async fn len(&self) -> usize {
        let store = self.store.read().await;
        store.values().filter(|entry| !entry.is_expired()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for AdaptiveCache {
    fn default() -> Self {
        Self::new(TtlPolicy::default())
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn response(content: &str) -> CachedResponse {
        CachedResponse {
            content: content.to_string(),
            model: "ops-llm-1".to_string(),
            tokens: 42,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_alert_context_shortens_ttl() {
        let policy = TtlPolicy::default();
        let calm = policy.ttl_for("infrastructure_monitoring", &[]);
        let alerting = policy.ttl_for("infrastructure_monitoring", &["alert_active"]);
        assert!(alerting < calm, "alerting={:?} calm={:?}", alerting, calm);
    }

    #[test]
    fn test_historical_context_extends_ttl() {
        let policy = TtlPolicy::default();
        let base = policy.ttl_for("cost_analysis", &[]);
        let historical = policy.ttl_for("cost_analysis", &["historical"]);
        assert!(historical > base);
    }

    #[test]
    fn test_ttl_floor_prevents_thrashing() {
        let policy = TtlPolicy::default();
        let ttl = policy.ttl_for(
            "infrastructure_monitoring",
            &["alert_active", "realtime_metrics", "alert_active"],
        );
        assert!(ttl >= Duration::from_secs(60));
    }

    #[test]
    fn test_fingerprint_tracks_prompt_text() {
        let a = fingerprint("general_chat", "what is my compute spend?", None, &[]);
        let b = fingerprint("general_chat", "list my instances", None, &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_ignores_factor_ordering() {
        let a = fingerprint("cost_analysis", "prompt", None, &["historical", "alert_active"]);
        let b = fingerprint("cost_analysis", "prompt", None, &["alert_active", "historical"]);
        assert_eq!(a, b);

        let c = fingerprint("cost_analysis", "prompt", Some("tight"), &["alert_active", "historical"]);
        assert_ne!(a, c);
        let d = fingerprint("cost_analysis", "prompt", None, &[]);
        assert_ne!(a, d);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = AdaptiveCache::default();
        cache
            .put_with_ttl("k1", response("stale"), Duration::from_millis(10))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("k1").await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_single_flight_collapses_concurrent_calls() {
        let cache = Arc::new(AdaptiveCache::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let generate = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(response("generated once"))
            }
        };

        let (a, b) = futures::join!(
            cache.get_or_generate("fp", "general_chat", &[], generate(calls.clone())),
            cache.get_or_generate("fp", "general_chat", &[], generate(calls.clone())),
        );
        let (resp_a, _) = a.unwrap();
        let (resp_b, _) = b.unwrap();
        assert_eq!(1, calls.load(Ordering::SeqCst));
        assert_eq!(resp_a.content, resp_b.content);

        // A later identical request is a plain cache hit.
        let (resp_c, cached) = cache
            .get_or_generate("fp", "general_chat", &[], generate(calls.clone()))
            .await
            .unwrap();
        assert!(cached);
        assert_eq!(1, calls.load(Ordering::SeqCst));
        assert_eq!("generated once", resp_c.content);
    }

    #[tokio::test]
    async fn test_failed_generation_allows_retry() {
        let cache = AdaptiveCache::default();
        let result = cache
            .get_or_generate("fp-err", "general_chat", &[], || async {
                Err(GenerateError::ModelUnavailable("backend down".to_string()))
            })
            .await;
        assert!(matches!(result, Err(GenerateError::ModelUnavailable(_))));

        let (resp, cached) = cache
            .get_or_generate("fp-err", "general_chat", &[], || async {
                Ok(response("recovered"))
            })
            .await
            .unwrap();
        assert!(!cached);
        assert_eq!("recovered", resp.content);
    }
}
