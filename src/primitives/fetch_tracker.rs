use std::sync::{Arc, Mutex};

use crate::cache::lock::mutex_lock;
use crate::runtime::observable::Subscription;

use super::reactive::Signal;

const SOURCE: &str = "primitives::fetch_tracker";

/// Tracks at most one in-flight network subscription for a primitive.
#[derive(Clone)]
pub struct FetchTracker {
    current: Arc<Mutex<Option<Subscription>>>,
    is_fetching: Signal<bool>,
}

impl Default for FetchTracker {
    fn default() -> Self {
        Self {
            current: Arc::new(Mutex::new(None)),
            is_fetching: Signal::new(false),
        }
    }
}

impl FetchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces (and cancels) any tracked fetch.
    pub fn start_fetch(&self, subscription: Subscription) {
        let previous = mutex_lock(&self.current, SOURCE, "start_fetch").replace(subscription);
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
        self.is_fetching.set_if_changed(true);
    }

    /// Forgets the tracked fetch without cancelling it.
    pub fn complete_fetch(&self) {
        mutex_lock(&self.current, SOURCE, "complete_fetch").take();
        self.is_fetching.set_if_changed(false);
    }

    pub fn dispose_fetch(&self) {
        let current = mutex_lock(&self.current, SOURCE, "dispose_fetch").take();
        if let Some(current) = current {
            current.unsubscribe();
        }
        self.is_fetching.set_if_changed(false);
    }

    pub fn is_fetching(&self) -> bool {
        self.is_fetching.get()
    }

    pub fn is_fetching_signal(&self) -> &Signal<bool> {
        &self.is_fetching
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::disposable::Disposable;
    use crate::runtime::observable::{Observable, Observer};

    fn never() -> Observable<u32> {
        Observable::create(|_sink| Disposable::noop())
    }

    #[test]
    fn starting_a_fetch_cancels_the_previous_one() {
        let tracker = FetchTracker::new();
        let first = never().subscribe(Observer::new());
        let second = never().subscribe(Observer::new());

        tracker.start_fetch(first.clone());
        assert!(tracker.is_fetching());
        tracker.start_fetch(second);

        assert!(first.is_closed());
        assert!(tracker.is_fetching());

        tracker.complete_fetch();
        assert!(!tracker.is_fetching());
    }

    #[test]
    fn dispose_unsubscribes_the_tracked_fetch() {
        let tracker = FetchTracker::new();
        let subscription = never().subscribe(Observer::new());
        tracker.start_fetch(subscription.clone());

        tracker.dispose_fetch();

        assert!(subscription.is_closed());
        assert!(!tracker.is_fetching());
    }
}
