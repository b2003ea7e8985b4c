//! Read-side helpers of the API service: a summary cache with a single builder, and the
//! permit serializing PGN uploads.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock, TryLockError,
    },
    time::{Duration, Instant},
};

use tracing::{debug, warn};

struct Snapshot<T> {
    value: Arc<T>,
    generation: u64,
    /// `None` once invalidated.
    built_at: Option<Instant>,
}

/// A cached value and the generation that built it. Generations only grow.
#[derive(Debug)]
pub struct Cached<T> {
    pub value: Arc<T>,
    pub generation: u64,
}

impl<T> Clone for Cached<T> {
    fn clone(&self) -> Self {
        Cached {
            value: Arc::clone(&self.value),
            generation: self.generation,
        }
    }
}

/// Time-bounded cache of an expensive summary.
///
/// At most one caller rebuilds at a time. While a rebuild is running, other callers get the
/// previous snapshot instead of waiting (they only wait when nothing was ever built). A failed
/// rebuild keeps the previous snapshot.
pub struct SummaryCache<T> {
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot<T>>>,
    building: Mutex<()>,
    generation: AtomicU64,
}

impl<T> SummaryCache<T> {
    pub fn new(ttl: Duration) -> Self {
        SummaryCache {
            ttl,
            snapshot: RwLock::new(None),
            building: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    fn read(&self, fresh_only: bool) -> Option<Cached<T>> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        let snapshot = guard.as_ref()?;
        let fresh = snapshot
            .built_at
            .is_some_and(|built_at| built_at.elapsed() < self.ttl);
        (fresh || !fresh_only).then(|| Cached {
            value: Arc::clone(&snapshot.value),
            generation: snapshot.generation,
        })
    }

    /// Return the cached value, rebuilding it with `build` when stale.
    pub fn get_or_refresh<F>(&self, build: F) -> anyhow::Result<Cached<T>>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        if let Some(fresh) = self.read(true) {
            return Ok(fresh);
        }
        let previous = self.read(false);
        let _guard = match (&previous, self.building.try_lock()) {
            (_, Ok(guard)) => guard,
            (_, Err(TryLockError::Poisoned(poisoned))) => poisoned.into_inner(),
            (Some(previous), Err(TryLockError::WouldBlock)) => {
                debug!(generation = previous.generation, "Rebuild in progress, serving previous summary");
                return Ok(previous.clone());
            }
            (None, Err(TryLockError::WouldBlock)) => {
                self.building.lock().unwrap_or_else(|e| e.into_inner())
            }
        };
        // another builder may have finished while we waited
        if let Some(fresh) = self.read(true) {
            return Ok(fresh);
        }

        match build() {
            Ok(value) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let value = Arc::new(value);
                *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Some(Snapshot {
                    value: Arc::clone(&value),
                    generation,
                    built_at: Some(Instant::now()),
                });
                Ok(Cached { value, generation })
            }
            Err(err) => {
                warn!("Summary rebuild failed: {err:#}");
                let Some(previous) = previous else {
                    return Err(err);
                };
                // do not retry on every request
                if let Some(snapshot) = self
                    .snapshot
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_mut()
                {
                    snapshot.built_at = Some(Instant::now());
                }
                Ok(previous)
            }
        }
    }

    /// Mark the snapshot stale. It is still served while the next rebuild runs.
    pub fn invalidate(&self) {
        if let Some(snapshot) = self
            .snapshot
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
        {
            snapshot.built_at = None;
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Counting permit of size one.
#[derive(Debug, Default)]
pub struct UploadGate {
    permit: Mutex<()>,
}

impl UploadGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _permit = self.permit.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }
}
