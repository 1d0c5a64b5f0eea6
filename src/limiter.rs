//! Global connection limiter
//!
//! Process-wide admission control over the primary-pooled connection
//! budget, partitioned by [`UsageClass`]. Each class owns a reserved quota;
//! whatever capacity remains forms a shared overflow pool. A caller first
//! consumes its own reserve and only then competes for shared permits, so a
//! class operating within its reserve never waits behind another class's
//! waiters.
//!
//! Permits are RAII guards: release happens on drop on every exit path,
//! including cancellation and panic unwind.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::LimiterConfig;
use crate::types::{UsageClass, UsageContext};

/// Partitioned admission gate over the global connection budget
#[derive(Clone)]
pub struct GlobalLimiter {
    reserves: Arc<HashMap<UsageClass, Arc<Semaphore>>>,
    shared: Arc<Semaphore>,
    total: usize,
}

/// RAII permit for one admitted connection use
#[derive(Debug)]
pub struct UsagePermit {
    _permit: OwnedSemaphorePermit,
    class: UsageClass,
    from_shared: bool,
}

impl UsagePermit {
    /// Class this permit was issued for
    pub fn class(&self) -> UsageClass {
        self.class
    }

    /// Whether the permit came from the shared overflow pool
    pub fn from_shared(&self) -> bool {
        self.from_shared
    }
}

impl GlobalLimiter {
    /// Build the limiter for a total budget and per-class reserves
    ///
    /// `total` is the primary-pooled connection capacity; callers must have
    /// validated `config.total_reserved() <= total` (see `Config::validate`).
    pub fn new(total: usize, config: &LimiterConfig) -> Self {
        let mut reserves = HashMap::new();
        for class in UsageClass::ALL {
            reserves.insert(class, Arc::new(Semaphore::new(config.reserved(class))));
        }
        let shared_count = total.saturating_sub(config.total_reserved());
        Self {
            reserves: Arc::new(reserves),
            shared: Arc::new(Semaphore::new(shared_count)),
            total,
        }
    }

    /// Acquire a permit for the context's class
    ///
    /// Consumes the class reserve first; once the reserve is exhausted the
    /// caller waits on both its reserve queue and the shared pool and takes
    /// whichever frees first. Cancellation (dropping the future) removes
    /// the waiter from both queues.
    pub async fn acquire(&self, ctx: &UsageContext) -> UsagePermit {
        let reserve = self.reserve(ctx.class);

        // Fast path: reserve permit available right now
        if let Ok(permit) = reserve.clone().try_acquire_owned() {
            tracing::trace!(class = %ctx.class, job = ctx.job_name.as_deref(), "limiter permit from reserve");
            return UsagePermit {
                _permit: permit,
                class: ctx.class,
                from_shared: false,
            };
        }

        tracing::trace!(class = %ctx.class, job = ctx.job_name.as_deref(), "limiter reserve exhausted, waiting");
        tokio::select! {
            permit = reserve.clone().acquire_owned() => UsagePermit {
                // The semaphore is never closed
                _permit: permit.expect("limiter reserve closed"),
                class: ctx.class,
                from_shared: false,
            },
            permit = self.shared.clone().acquire_owned() => UsagePermit {
                _permit: permit.expect("limiter shared pool closed"),
                class: ctx.class,
                from_shared: true,
            },
        }
    }

    /// Permits currently available to a class without waiting behind
    /// another class (its reserve plus the shared pool)
    pub fn available(&self, class: UsageClass) -> usize {
        self.reserve(class).available_permits() + self.shared.available_permits()
    }

    /// Shared-pool permits currently free
    pub fn shared_available(&self) -> usize {
        self.shared.available_permits()
    }

    /// Total budget the limiter was built with
    pub fn total(&self) -> usize {
        self.total
    }

    fn reserve(&self, class: UsageClass) -> &Arc<Semaphore> {
        self.reserves
            .get(&class)
            .expect("limiter covers every usage class")
    }
}
