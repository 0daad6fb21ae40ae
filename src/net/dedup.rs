//! Request Deduplication
//!
//! Collapses concurrent identical read requests into a single network call.
//! Every caller joining an in-flight request receives the same value or the
//! same error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::api::ApiError;

/// Requests older than this are no longer joined
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(30);

type SharedRequest<T> = Shared<BoxFuture<'static, Result<T, ApiError>>>;

struct InFlight<T> {
    request: SharedRequest<T>,
    issued_at: Instant,
    generation: u64,
}

type Registry<T> = Arc<Mutex<HashMap<String, InFlight<T>>>>;

/// Build a deterministic request key from an endpoint and its parameters
///
/// Parameters are sorted by name, so the same logical request built in a
/// different order maps to the same key.
pub fn generate_request_key<K, V, I>(endpoint: &str, params: I) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
    I: IntoIterator<Item = (K, V)>,
{
    let mut pairs: Vec<(String, String)> = params
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
        .collect();
    if pairs.is_empty() {
        return endpoint.to_string();
    }
    pairs.sort();

    let query = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", endpoint, query)
}

/// In-flight request registry keyed by request key
pub struct Deduplicator<T> {
    in_flight: Registry<T>,
    window: Duration,
    next_generation: AtomicU64,
    /// Number of underlying requests actually issued
    issued: AtomicU64,
}

impl<T> Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(window: Duration) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            window,
            next_generation: AtomicU64::new(0),
            issued: AtomicU64::new(0),
        }
    }

    /// Run `request_fn` unless an identical request is already in flight
    ///
    /// A registration is dropped when its request settles or once it is
    /// older than the staleness window, whichever comes first.
    pub async fn deduplicate<F, Fut>(&self, key: &str, request_fn: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let request = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(key) {
                Some(entry) if entry.issued_at.elapsed() < self.window => {
                    debug!(key = key, "Joining in-flight request");
                    entry.request.clone()
                }
                stale => {
                    if stale.is_some() {
                        trace!(key = key, "Replacing stale in-flight request");
                    }
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let request = self.register(key, generation, request_fn());
                    in_flight.insert(
                        key.to_string(),
                        InFlight {
                            request: request.clone(),
                            issued_at: Instant::now(),
                            generation,
                        },
                    );
                    self.issued.fetch_add(1, Ordering::Relaxed);
                    request
                }
            }
        };

        request.await
    }

    /// Wrap a request so it unregisters itself when it settles
    fn register<Fut>(&self, key: &str, generation: u64, future: Fut) -> SharedRequest<T>
    where
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let registry = Arc::clone(&self.in_flight);
        let key = key.to_string();

        async move {
            let result = future.await;
            let mut in_flight = registry.lock().unwrap_or_else(PoisonError::into_inner);
            if in_flight.get(&key).map(|e| e.generation) == Some(generation) {
                in_flight.remove(&key);
                trace!(key = %key, "In-flight request settled");
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Number of registered in-flight requests
    pub fn pending(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of underlying requests issued so far
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Forget every registration; callers already waiting still complete
    pub fn clear(&self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl<T> Default for Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}
