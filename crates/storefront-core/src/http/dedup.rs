//! Keyed single-flight.
//!
//! Concurrent callers asking for the same key share one execution and all
//! receive the same outcome. The entry exists only while the execution is
//! in flight; later callers start a new one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use super::task_failure;
use crate::error::ApiError;

type InFlight<T> = Shared<BoxFuture<'static, Result<T, ApiError>>>;

pub struct DedupCache<T> {
    inflight: Arc<Mutex<HashMap<String, InFlight<T>>>>,
}

impl<T> Clone for DedupCache<T> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<T> Default for DedupCache<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

fn lock<T>(map: &Mutex<HashMap<String, InFlight<T>>>) -> MutexGuard<'_, HashMap<String, InFlight<T>>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T> DedupCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `request` under `key`, or join the execution already in flight.
    pub async fn dedup<F, Fut>(&self, key: &str, request: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let shared = {
            let mut inflight = lock(&self.inflight);
            match inflight.get(key) {
                Some(existing) => {
                    debug!(key, "Joining in-flight request");
                    existing.clone()
                }
                None => {
                    let registry = Arc::clone(&self.inflight);
                    let owned_key = key.to_string();
                    // The entry is inserted below while the lock is held, so
                    // the task cannot remove it before it exists.
                    let handle = tokio::spawn(async move {
                        let result = request().await;
                        lock(&registry).remove(&owned_key);
                        result
                    });
                    let shared = async move { handle.await.map_err(task_failure)? }
                        .boxed()
                        .shared();
                    inflight.insert(key.to_string(), shared.clone());
                    shared
                }
            }
        };
        shared.await
    }

    /// Number of keys currently in flight
    pub fn in_flight(&self) -> usize {
        lock(&self.inflight).len()
    }
}
