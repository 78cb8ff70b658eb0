use crate::throttle::{Clock, ObtainThrottle, TokioClock};
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

/// Independent [ObtainThrottle]s keyed by name, for example one per provider account or
/// per cloud-director endpoint, stored in a [DashMap](dashmap::DashMap).
#[derive(Clone)]
pub struct ThrottleRegistry<C = TokioClock> {
    map: Arc<DashMap<String, Arc<ObtainThrottle<C>>>>,
    min_interval: Duration,
    clock: C,
    _gc_guard: Option<Arc<CollectorGuard>>,
}

/// Stops the garbage collector once the last registry clone sharing it is gone.
struct CollectorGuard(JoinHandle<()>);

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl ThrottleRegistry {
    /// # Arguments
    ///
    /// * `min_interval`: The spacing enforced by every throttle created by the registry.
    pub fn builder(min_interval: Duration) -> ThrottleRegistryBuilder<TokioClock> {
        ThrottleRegistryBuilder {
            min_interval,
            clock: TokioClock,
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
        }
    }
}

impl<C: Clock + Clone> ThrottleRegistry<C> {
    /// Returns the throttle for `key`, creating it on first use.
    pub fn throttle(&self, key: &str) -> Arc<ObtainThrottle<C>> {
        if let Some(existing) = self.map.get(key) {
            return existing.value().clone();
        }
        self.map
            .entry(key.to_owned())
            .or_insert_with(|| {
                log::debug!("Creating obtain throttle for {key}");
                Arc::new(
                    ObtainThrottle::builder()
                        .with_min_interval(self.min_interval)
                        .with_clock(self.clock.clone())
                        .build(),
                )
            })
            .value()
            .clone()
    }

    /// Forgets the throttle for a given key; callers still holding it keep their own spacing.
    pub fn remove_key(&self, key: &str) {
        self.map.remove(key);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn garbage_collector(
        map: Arc<DashMap<String, Arc<ObtainThrottle<C>>>>,
        interval: Duration,
    ) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                let now = Instant::now();
                // Only drop throttles nobody else holds and whose last slot has fully elapsed
                map.retain(|_k, v| Arc::strong_count(v) > 1 || !v.is_idle());
                actix_web::rt::time::sleep_until(now + interval).await;
            }
        })
    }
}

pub struct ThrottleRegistryBuilder<C> {
    min_interval: Duration,
    clock: C,
    gc_interval: Option<Duration>,
}

impl<C: Clock + Clone> ThrottleRegistryBuilder<C> {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically scans the registry, removing idle throttles.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Override the source of time given to each throttle.
    pub fn with_clock<T: Clock + Clone>(self, clock: T) -> ThrottleRegistryBuilder<T> {
        ThrottleRegistryBuilder {
            min_interval: self.min_interval,
            clock,
            gc_interval: self.gc_interval,
        }
    }

    pub fn build(self) -> ThrottleRegistry<C> {
        let map = Arc::new(DashMap::new());
        let gc_guard = self.gc_interval.map(|gc_interval| {
            Arc::new(CollectorGuard(ThrottleRegistry::<C>::garbage_collector(
                map.clone(),
                gc_interval,
            )))
        });
        ThrottleRegistry {
            map,
            min_interval: self.min_interval,
            clock: self.clock,
            _gc_guard: gc_guard,
        }
    }
}
