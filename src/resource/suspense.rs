//! Two-phase retention over one underlying disposable.
//!
//! A render retains temporarily (time-boxed, since the render may never
//! commit); a commit converts that into a permanent retain. The underlying
//! resource is held iff the outstanding retain count is non-zero.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, error};

use crate::cache::lock::mutex_lock;
use crate::runtime::disposable::Disposable;
use crate::runtime::environment::Environment;

const SOURCE: &str = "resource::suspense";

pub const DEFAULT_TEMPORARY_RETAIN: Duration = Duration::from_secs(5 * 60);

pub type RetainFn = Arc<dyn Fn(&dyn Environment) -> Disposable + Send + Sync>;

struct TemporarySlot {
    generation: u64,
    retention: Disposable,
    timer: Option<AbortHandle>,
}

impl TemporarySlot {
    fn release(mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.retention.dispose();
    }
}

#[derive(Default)]
struct RetainState {
    count: usize,
    disposable: Option<Disposable>,
    temporary: Option<TemporarySlot>,
    next_generation: u64,
}

/// Retain counter guarding a single underlying retention.
#[derive(Clone)]
pub struct SuspenseResource {
    state: Arc<Mutex<RetainState>>,
    retain: RetainFn,
    temporary_retain: Duration,
}

impl fmt::Debug for SuspenseResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspenseResource")
            .field("retain_count", &self.retain_count())
            .field("temporary_retain", &self.temporary_retain)
            .finish()
    }
}

impl SuspenseResource {
    pub fn new(
        retain: impl Fn(&dyn Environment) -> Disposable + Send + Sync + 'static,
        temporary_retain: Duration,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(RetainState::default())),
            retain: Arc::new(retain),
            temporary_retain,
        }
    }

    pub fn retain_count(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "retain_count").count
    }

    /// Retain issued during a render that may never commit. Expires after the
    /// temporary retain duration unless superseded, converted or released.
    ///
    /// Server environments never commit, so this is a no-op there.
    pub fn temporary_retain(&self, env: &dyn Environment) -> Disposable {
        if env.is_server() {
            return Disposable::noop();
        }

        let retention = self.acquire(env);
        let generation = {
            let mut state = mutex_lock(&self.state, SOURCE, "temporary_retain");
            state.next_generation += 1;
            state.next_generation
        };
        let timer = self.arm_timer(generation);

        // The new slot is installed before the previous one is released so the
        // count never dips to zero in between.
        let previous = mutex_lock(&self.state, SOURCE, "temporary_retain").temporary.replace(
            TemporarySlot {
                generation,
                retention,
                timer,
            },
        );
        if let Some(previous) = previous {
            previous.release();
        }

        let state = self.state.clone();
        Disposable::new(move || release_slot(&state, Some(generation)))
    }

    /// Retain issued once the render commits. Clears any temporary retain.
    pub fn permanent_retain(&self, env: &dyn Environment) -> Disposable {
        let disposable = self.acquire(env);
        self.release_temporary_retain();
        disposable
    }

    pub fn release_temporary_retain(&self) {
        release_slot(&self.state, None);
    }

    fn acquire(&self, env: &dyn Environment) -> Disposable {
        let first = {
            let mut state = mutex_lock(&self.state, SOURCE, "acquire");
            state.count += 1;
            state.count == 1
        };
        if first {
            debug!(target_module = SOURCE, "Retaining underlying resource");
            let disposable = (self.retain)(env);
            mutex_lock(&self.state, SOURCE, "acquire").disposable = Some(disposable);
        }

        let state = self.state.clone();
        Disposable::new(move || {
            let released = {
                let mut guard = mutex_lock(&state, SOURCE, "release");
                if guard.count == 0 {
                    return;
                }
                guard.count -= 1;
                if guard.count > 0 {
                    return;
                }
                guard.disposable.take()
            };
            match released {
                Some(mut disposable) => {
                    debug!(target_module = SOURCE, "Releasing underlying resource");
                    disposable.dispose();
                }
                None => error!(
                    target_module = SOURCE,
                    "Expected a retained resource to release at retain count zero"
                ),
            }
        })
    }

    fn arm_timer(&self, generation: u64) -> Option<AbortHandle> {
        let Ok(handle) = Handle::try_current() else {
            debug!(
                target_module = SOURCE,
                "No async runtime; temporary retain will not expire on its own"
            );
            return None;
        };
        let state = self.state.clone();
        let duration = self.temporary_retain;
        let task = handle.spawn(async move {
            tokio::time::sleep(duration).await;
            debug!(target_module = SOURCE, generation, "Temporary retain expired");
            release_slot(&state, Some(generation));
        });
        Some(task.abort_handle())
    }
}

/// Releases the temporary slot; `Some(generation)` releases only that slot.
fn release_slot(state: &Mutex<RetainState>, generation: Option<u64>) {
    let slot = {
        let mut guard = mutex_lock(state, SOURCE, "release_slot");
        match (&guard.temporary, generation) {
            (Some(slot), Some(generation)) if slot.generation != generation => None,
            _ => guard.temporary.take(),
        }
    };
    if let Some(slot) = slot {
        slot.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::runtime::memory::{EnvironmentOptions, MemoryEnvironment, ScriptedNetwork};

    struct Counted {
        resource: SuspenseResource,
        retains: Arc<AtomicUsize>,
        disposes: Arc<AtomicUsize>,
    }

    fn counted() -> Counted {
        let retains = Arc::new(AtomicUsize::new(0));
        let disposes = Arc::new(AtomicUsize::new(0));
        let retain_counter = retains.clone();
        let dispose_counter = disposes.clone();
        let resource = SuspenseResource::new(
            move |_env| {
                retain_counter.fetch_add(1, Ordering::SeqCst);
                let dispose_counter = dispose_counter.clone();
                Disposable::new(move || {
                    dispose_counter.fetch_add(1, Ordering::SeqCst);
                })
            },
            DEFAULT_TEMPORARY_RETAIN,
        );
        Counted {
            resource,
            retains,
            disposes,
        }
    }

    fn env(is_server: bool) -> Arc<MemoryEnvironment> {
        MemoryEnvironment::new(
            Arc::new(ScriptedNetwork::new()),
            EnvironmentOptions {
                is_server,
                ..EnvironmentOptions::default()
            },
        )
    }

    #[test]
    fn temporary_then_permanent_keeps_one_retention() {
        let env = env(false);
        let counted = counted();

        let _temporary = counted.resource.temporary_retain(env.as_ref());
        let mut permanent = counted.resource.permanent_retain(env.as_ref());

        assert_eq!(counted.resource.retain_count(), 1);
        assert_eq!(counted.retains.load(Ordering::SeqCst), 1);
        assert_eq!(counted.disposes.load(Ordering::SeqCst), 0);

        permanent.dispose();
        assert_eq!(counted.resource.retain_count(), 0);
        assert_eq!(counted.disposes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeated_temporary_retains_supersede() {
        let env = env(false);
        let counted = counted();

        let mut first = counted.resource.temporary_retain(env.as_ref());
        let _second = counted.resource.temporary_retain(env.as_ref());
        assert_eq!(counted.resource.retain_count(), 1);

        // The superseded slot is already gone.
        first.dispose();
        assert_eq!(counted.resource.retain_count(), 1);

        counted.resource.release_temporary_retain();
        assert_eq!(counted.resource.retain_count(), 0);
        assert_eq!(counted.retains.load(Ordering::SeqCst), 1);
        assert_eq!(counted.disposes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn server_environment_skips_temporary_retain() {
        let env = env(true);
        let counted = counted();

        let _temporary = counted.resource.temporary_retain(env.as_ref());

        assert_eq!(counted.resource.retain_count(), 0);
        assert_eq!(counted.retains.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn over_disposal_is_safe() {
        let env = env(false);
        let counted = counted();

        let mut a = counted.resource.permanent_retain(env.as_ref());
        let mut b = counted.resource.permanent_retain(env.as_ref());
        a.dispose();
        a.dispose();
        b.dispose();
        counted.resource.release_temporary_retain();

        assert_eq!(counted.resource.retain_count(), 0);
        assert_eq!(counted.disposes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn temporary_retain_expires() {
        let env = env(false);
        let counted = counted();

        let _temporary = counted.resource.temporary_retain(env.as_ref());
        tokio::time::sleep(DEFAULT_TEMPORARY_RETAIN - Duration::from_secs(1)).await;
        assert_eq!(counted.resource.retain_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counted.resource.retain_count(), 0);
        assert_eq!(counted.disposes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_retain_cancels_expiry() {
        let env = env(false);
        let counted = counted();

        let _temporary = counted.resource.temporary_retain(env.as_ref());
        let _permanent = counted.resource.permanent_retain(env.as_ref());
        tokio::time::sleep(DEFAULT_TEMPORARY_RETAIN * 2).await;

        assert_eq!(counted.resource.retain_count(), 1);
        assert_eq!(counted.disposes.load(Ordering::SeqCst), 0);
    }
}
