#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
mod registry;

#[cfg(feature = "dashmap")]
pub use registry::{ThrottleRegistry, ThrottleRegistryBuilder};

use actix_web::rt::time::Instant;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Source of time for an [ObtainThrottle].
///
/// Production code uses [TokioClock]; tests can substitute their own implementation, or pause
/// the tokio clock.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    fn sleep_until(&self, deadline: Instant) -> impl Future<Output = ()> + Send;
}

/// A [Clock] backed by the runtime's timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) -> impl Future<Output = ()> + Send {
        actix_web::rt::time::sleep_until(deadline)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleError {
    #[error("Admission would require waiting {required:?}, longer than the permitted {permitted:?}")]
    WaitExceeded {
        required: Duration,
        permitted: Duration,
    },
}

/// The outcome of a successful call to [ObtainThrottle::admit].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// The slot this caller was admitted at.
    pub admitted_at: Instant,
    /// How long the caller was suspended before being admitted.
    pub waited: Duration,
}

#[derive(Default)]
struct State {
    last_admit: Option<Instant>,
    last_seen: Option<Instant>,
}

struct Reservation {
    now: Instant,
    slot: Instant,
}

/// Paces the start of provisioning calls so that no two are admitted within `min_interval` of
/// each other.
///
/// Only the decision to start is serialized: the state lock is held just long enough to reserve
/// the next slot, and callers wait out their slot without holding it. Admitted calls may run
/// concurrently, and no ordering between racing callers is guaranteed.
///
/// If an [admit](ObtainThrottle::admit) future is dropped while waiting, its slot stays
/// reserved.
pub struct ObtainThrottle<C = TokioClock> {
    min_interval: Duration,
    clock: C,
    state: Mutex<State>,
}

impl ObtainThrottle {
    pub fn builder() -> ObtainThrottleBuilder<TokioClock> {
        ObtainThrottleBuilder {
            min_interval: Duration::ZERO,
            clock: TokioClock,
        }
    }

    pub fn new(min_interval: Duration) -> Self {
        Self::builder().with_min_interval(min_interval).build()
    }

    /// A throttle that admits every call immediately.
    pub fn disabled() -> Self {
        Self::builder().build()
    }
}

impl<C: Clock> ObtainThrottle<C> {
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Suspends until this caller may begin its provisioning call.
    pub async fn admit(&self) -> Admission {
        match self.reserve(Duration::MAX) {
            Ok(reservation) => self.wait_for(reservation).await,
            Err(required) => unreachable!("required wait {required:?} exceeds Duration::MAX"),
        }
    }

    /// Like [ObtainThrottle::admit], but refuses (without reserving a slot) if the caller would
    /// have to wait longer than `max_wait`.
    pub async fn admit_within(&self, max_wait: Duration) -> Result<Admission, ThrottleError> {
        match self.reserve(max_wait) {
            Ok(reservation) => Ok(self.wait_for(reservation).await),
            Err(required) => Err(ThrottleError::WaitExceeded {
                required,
                permitted: max_wait,
            }),
        }
    }

    /// Admits the caller, then drives `work` to completion.
    ///
    /// The output of `work`, including any error, is returned untouched.
    pub async fn run<F: Future>(&self, work: F) -> F::Output {
        self.admit().await;
        work.await
    }

    /// True if a call arriving now would be admitted without waiting.
    pub fn is_idle(&self) -> bool {
        let now = self.clock.now();
        match self.state().last_admit {
            None => true,
            Some(last) => last
                .checked_add(self.min_interval)
                .map_or(false, |next| now >= next),
        }
    }

    async fn wait_for(&self, reservation: Reservation) -> Admission {
        let Reservation { now, slot } = reservation;
        let waited = slot.saturating_duration_since(now);
        if waited.is_zero() {
            log::debug!("provision - continuing immediately as no other recent call");
        } else {
            log::info!(
                "provision - waiting for {}ms as another obtain call executed recently",
                waited.as_millis()
            );
            self.clock.sleep_until(slot).await;
        }
        Admission {
            admitted_at: slot,
            waited,
        }
    }

    // Returns the required wait if it exceeds `limit`.
    fn reserve(&self, limit: Duration) -> Result<Reservation, Duration> {
        if self.min_interval.is_zero() {
            let now = self.clock.now();
            return Ok(Reservation { now, slot: now });
        }
        let mut state = self.state();
        let now = self.clock.now();
        let slot = match (state.last_admit, state.last_seen) {
            (Some(_), Some(seen)) if now < seen => {
                log::warn!(
                    "provision - clock went backwards by {}ms, admitting immediately",
                    (seen - now).as_millis()
                );
                now
            }
            (Some(last), _) => match last.checked_add(self.min_interval) {
                Some(next) => next.max(now),
                None => now,
            },
            (None, _) => now,
        };
        let required = slot.saturating_duration_since(now);
        if required > limit {
            return Err(required);
        }
        state.last_admit = Some(slot);
        state.last_seen = Some(now);
        Ok(Reservation { now, slot })
    }

    // Nothing panics while the lock is held, but recover rather than propagate a poisoned lock.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ObtainThrottleBuilder<C> {
    min_interval: Duration,
    clock: C,
}

impl<C: Clock> ObtainThrottleBuilder<C> {
    /// The minimum spacing between admissions.
    ///
    /// Default is zero, which disables throttling.
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// Interval in milliseconds as it appears in configuration; negative values disable
    /// throttling.
    pub fn with_min_interval_millis(self, millis: i64) -> Self {
        self.with_min_interval(Duration::from_millis(millis.max(0) as u64))
    }

    /// Override the source of time.
    pub fn with_clock<T: Clock>(self, clock: T) -> ObtainThrottleBuilder<T> {
        ObtainThrottleBuilder {
            min_interval: self.min_interval,
            clock,
        }
    }

    pub fn build(self) -> ObtainThrottle<C> {
        ObtainThrottle {
            min_interval: self.min_interval,
            clock: self.clock,
            state: Mutex::new(State::default()),
        }
    }
}
