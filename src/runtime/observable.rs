//! Push-based streams with the `{start, next, error, complete, unsubscribe}`
//! observer protocol, plus a replaying subject used for request dedup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::lock::mutex_lock;
use crate::error::RelayError;

use super::disposable::Disposable;

const SOURCE: &str = "runtime::observable";

type StartFn = Arc<dyn Fn(&Subscription) + Send + Sync>;
type NextFn<T> = Arc<dyn Fn(T) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(RelayError) + Send + Sync>;
type CompleteFn = Arc<dyn Fn() + Send + Sync>;
type UnsubscribeFn = Arc<dyn Fn(&Subscription) + Send + Sync>;

pub struct Observer<T> {
    start: Option<StartFn>,
    next: Option<NextFn<T>>,
    error: Option<ErrorFn>,
    complete: Option<CompleteFn>,
    unsubscribe: Option<UnsubscribeFn>,
}

impl<T> Default for Observer<T> {
    fn default() -> Self {
        Self {
            start: None,
            next: None,
            error: None,
            complete: None,
            unsubscribe: None,
        }
    }
}

impl<T> Clone for Observer<T> {
    fn clone(&self) -> Self {
        Self {
            start: self.start.clone(),
            next: self.next.clone(),
            error: self.error.clone(),
            complete: self.complete.clone(),
            unsubscribe: self.unsubscribe.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Observer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, f: impl Fn(&Subscription) + Send + Sync + 'static) -> Self {
        self.start = Some(Arc::new(f));
        self
    }

    pub fn on_next(mut self, f: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.next = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(RelayError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Arc::new(f));
        self
    }

    pub fn on_unsubscribe(mut self, f: impl Fn(&Subscription) + Send + Sync + 'static) -> Self {
        self.unsubscribe = Some(Arc::new(f));
        self
    }

    /// Observer relaying every terminal and value event into `sink`.
    pub fn forward(sink: Sink<T>) -> Self {
        let next_sink = sink.clone();
        let error_sink = sink.clone();
        Self::new()
            .on_next(move |value| next_sink.next(value))
            .on_error(move |error| error_sink.error(error))
            .on_complete(move || sink.complete())
    }

    pub(crate) fn emit_start(&self, subscription: &Subscription) {
        if let Some(start) = &self.start {
            start(subscription);
        }
    }

    pub(crate) fn emit_next(&self, value: T) {
        if let Some(next) = &self.next {
            next(value);
        }
    }

    pub(crate) fn emit_error(&self, error: RelayError) {
        if let Some(on_error) = &self.error {
            on_error(error);
        }
    }

    pub(crate) fn emit_complete(&self) {
        if let Some(complete) = &self.complete {
            complete();
        }
    }

    pub(crate) fn emit_unsubscribe(&self, subscription: &Subscription) {
        if let Some(unsubscribe) = &self.unsubscribe {
            unsubscribe(subscription);
        }
    }
}

type UnsubscribeHook = Box<dyn FnOnce(&Subscription) + Send>;

#[derive(Default)]
struct SubscriptionState {
    closed: AtomicBool,
    cleanup: Mutex<Option<Disposable>>,
    on_unsubscribe: Mutex<Option<UnsubscribeHook>>,
}

impl SubscriptionState {
    fn run_cleanup(&self) {
        let cleanup = mutex_lock(&self.cleanup, SOURCE, "run_cleanup").take();
        if let Some(mut cleanup) = cleanup {
            cleanup.dispose();
        }
    }

    fn set_cleanup(&self, mut cleanup: Disposable) {
        if self.closed.load(Ordering::SeqCst) {
            cleanup.dispose();
            return;
        }
        *mutex_lock(&self.cleanup, SOURCE, "set_cleanup") = Some(cleanup);
        // Closed while the source was still running.
        if self.closed.load(Ordering::SeqCst) {
            self.run_cleanup();
        }
    }
}

/// Handle to an active stream subscription.
#[derive(Clone)]
pub struct Subscription {
    state: Arc<SubscriptionState>,
    cancellable: bool,
}

impl Subscription {
    /// Cancels the stream. Only the first call (or a terminal event) counts.
    pub fn unsubscribe(&self) {
        if !self.cancellable || self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = mutex_lock(&self.state.on_unsubscribe, SOURCE, "unsubscribe").take();
        if let Some(hook) = hook {
            hook(self);
        }
        self.state.run_cleanup();
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Copy of this handle whose `unsubscribe` is a no-op.
    pub fn detached(&self) -> Self {
        Self {
            state: self.state.clone(),
            cancellable: false,
        }
    }
}

/// Producer side of a subscription. Events after a terminal event are dropped.
pub struct Sink<T> {
    state: Arc<SubscriptionState>,
    observer: Arc<Mutex<Option<Observer<T>>>>,
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            observer: self.observer.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Sink<T> {
    pub fn next(&self, value: T) {
        if self.is_closed() {
            return;
        }
        let observer = mutex_lock(&self.observer, SOURCE, "sink_next").clone();
        if let Some(observer) = observer {
            observer.emit_next(value);
        }
    }

    pub fn error(&self, error: RelayError) {
        if let Some(observer) = self.close() {
            observer.emit_error(error);
        }
        self.state.run_cleanup();
    }

    pub fn complete(&self) {
        if let Some(observer) = self.close() {
            observer.emit_complete();
        }
        self.state.run_cleanup();
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn close(&self) -> Option<Observer<T>> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        mutex_lock(&self.state.on_unsubscribe, SOURCE, "sink_close").take();
        mutex_lock(&self.observer, SOURCE, "sink_close").take()
    }
}

type SourceFn<T> = Arc<dyn Fn(Sink<T>) -> Disposable + Send + Sync>;

/// A lazy stream: nothing runs until `subscribe`.
pub struct Observable<T> {
    source: SourceFn<T>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Observable<T> {
    pub fn create(source: impl Fn(Sink<T>) -> Disposable + Send + Sync + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    pub fn subscribe(&self, observer: Observer<T>) -> Subscription {
        let state = Arc::new(SubscriptionState::default());
        let slot = Arc::new(Mutex::new(Some(observer.clone())));
        let hook_slot = slot.clone();
        *mutex_lock(&state.on_unsubscribe, SOURCE, "subscribe") =
            Some(Box::new(move |subscription: &Subscription| {
                let observer = mutex_lock(&hook_slot, SOURCE, "on_unsubscribe").take();
                if let Some(observer) = observer {
                    observer.emit_unsubscribe(subscription);
                }
            }));

        let subscription = Subscription {
            state: state.clone(),
            cancellable: true,
        };
        observer.emit_start(&subscription);
        if subscription.is_closed() {
            return subscription;
        }

        let cleanup = (self.source)(Sink {
            state: state.clone(),
            observer: slot,
        });
        state.set_cleanup(cleanup);
        subscription
    }

    pub fn empty() -> Self {
        Self::create(|sink| {
            sink.complete();
            Disposable::noop()
        })
    }

    pub fn from_value(value: T) -> Self
    where
        T: Sync,
    {
        Self::create(move |sink| {
            sink.next(value.clone());
            sink.complete();
            Disposable::noop()
        })
    }

    pub fn from_error(error: RelayError) -> Self {
        Self::create(move |sink| {
            sink.error(error.clone());
            Disposable::noop()
        })
    }

    /// Subscribes to `fallback` instead when this stream completes without
    /// emitting anything.
    pub fn if_empty(&self, fallback: Observable<T>) -> Self {
        let primary = self.clone();
        Self::create(move |sink| {
            let emitted = Arc::new(AtomicBool::new(false));
            let current: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

            let next_sink = sink.clone();
            let error_sink = sink.clone();
            let complete_sink = sink.clone();
            let seen = emitted.clone();
            let seen_on_complete = emitted.clone();
            let fallback = fallback.clone();
            let fallback_slot = current.clone();
            let subscription = primary.subscribe(
                Observer::new()
                    .on_next(move |value| {
                        seen.store(true, Ordering::SeqCst);
                        next_sink.next(value);
                    })
                    .on_error(move |error| error_sink.error(error))
                    .on_complete(move || {
                        if seen_on_complete.load(Ordering::SeqCst) {
                            complete_sink.complete();
                        } else {
                            let inner = fallback.subscribe(Observer::forward(complete_sink.clone()));
                            *mutex_lock(&fallback_slot, SOURCE, "if_empty") = Some(inner);
                        }
                    }),
            );
            Disposable::new(move || {
                subscription.unsubscribe();
                let inner = mutex_lock(&current, SOURCE, "if_empty_cleanup").take();
                if let Some(inner) = inner {
                    inner.unsubscribe();
                }
            })
        })
    }
}

enum Event<T> {
    Next(T),
    Error(RelayError),
    Complete,
}

impl<T: Clone> Clone for Event<T> {
    fn clone(&self) -> Self {
        match self {
            Event::Next(value) => Event::Next(value.clone()),
            Event::Error(error) => Event::Error(error.clone()),
            Event::Complete => Event::Complete,
        }
    }
}

struct ReplayState<T> {
    events: Vec<Event<T>>,
    sinks: Vec<(u64, Sink<T>)>,
    next_id: u64,
    terminated: bool,
}

/// Records every event and replays the history to late subscribers.
pub struct ReplaySubject<T> {
    state: Arc<Mutex<ReplayState<T>>>,
}

impl<T> Clone for ReplaySubject<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for ReplaySubject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> ReplaySubject<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ReplayState {
                events: Vec::new(),
                sinks: Vec::new(),
                next_id: 0,
                terminated: false,
            })),
        }
    }

    pub fn next(&self, value: T) {
        let sinks = {
            let mut state = mutex_lock(&self.state, SOURCE, "replay_next");
            if state.terminated {
                return;
            }
            state.events.push(Event::Next(value.clone()));
            state.sinks.iter().map(|(_, sink)| sink.clone()).collect::<Vec<_>>()
        };
        for sink in sinks {
            sink.next(value.clone());
        }
    }

    pub fn error(&self, error: RelayError) {
        for sink in self.terminate(Event::Error(error.clone())) {
            sink.error(error.clone());
        }
    }

    pub fn complete(&self) {
        for sink in self.terminate(Event::Complete) {
            sink.complete();
        }
    }

    pub fn is_terminated(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "replay_is_terminated").terminated
    }

    fn terminate(&self, event: Event<T>) -> Vec<Sink<T>> {
        let mut state = mutex_lock(&self.state, SOURCE, "replay_terminate");
        if state.terminated {
            return Vec::new();
        }
        state.terminated = true;
        state.events.push(event);
        state.sinks.drain(..).map(|(_, sink)| sink).collect()
    }

    pub fn observable(&self) -> Observable<T> {
        let state = self.state.clone();
        Observable::create(move |sink| {
            let (history, id) = {
                let mut guard = mutex_lock(&state, SOURCE, "replay_subscribe");
                let history = guard.events.clone();
                let id = (!guard.terminated).then(|| {
                    guard.next_id += 1;
                    let id = guard.next_id;
                    guard.sinks.push((id, sink.clone()));
                    id
                });
                (history, id)
            };
            for event in history {
                match event {
                    Event::Next(value) => sink.next(value),
                    Event::Error(error) => sink.error(error),
                    Event::Complete => sink.complete(),
                }
            }
            let state = state.clone();
            Disposable::new(move || {
                if let Some(id) = id {
                    mutex_lock(&state, SOURCE, "replay_unsubscribe")
                        .sinks
                        .retain(|(sink_id, _)| *sink_id != id);
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn recorder() -> (Observer<u32>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let next_log = log.clone();
        let error_log = log.clone();
        let complete_log = log.clone();
        let unsubscribe_log = log.clone();
        let observer = Observer::new()
            .on_next(move |value: u32| next_log.lock().unwrap().push(format!("next:{value}")))
            .on_error(move |error| error_log.lock().unwrap().push(format!("error:{error}")))
            .on_complete(move || complete_log.lock().unwrap().push("complete".into()))
            .on_unsubscribe(move |_| unsubscribe_log.lock().unwrap().push("unsubscribe".into()));
        (observer, log)
    }

    #[test]
    fn events_after_completion_are_dropped() {
        let (observer, log) = recorder();
        let source = Observable::create(|sink: Sink<u32>| {
            sink.next(1);
            sink.complete();
            sink.next(2);
            Disposable::noop()
        });

        let subscription = source.subscribe(observer);
        subscription.unsubscribe();

        assert_eq!(*log.lock().unwrap(), vec!["next:1", "complete"]);
    }

    #[test]
    fn unsubscribe_runs_cleanup_and_notifies_once() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = cleanups.clone();
        let source = Observable::create(move |_sink: Sink<u32>| {
            let counter = counter.clone();
            Disposable::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        let (observer, log) = recorder();

        let subscription = source.subscribe(observer);
        subscription.unsubscribe();
        subscription.unsubscribe();

        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(*log.lock().unwrap(), vec!["unsubscribe"]);
    }

    #[test]
    fn detached_subscription_cannot_cancel() {
        let subject = ReplaySubject::<u32>::new();
        let (observer, log) = recorder();
        let subscription = subject.observable().subscribe(observer);

        subscription.detached().unsubscribe();
        subject.next(5);

        assert!(!subscription.is_closed());
        assert_eq!(*log.lock().unwrap(), vec!["next:5"]);
    }

    #[test]
    fn replay_subject_replays_history_to_late_subscribers() {
        let subject = ReplaySubject::new();
        subject.next(1);
        subject.next(2);
        subject.complete();

        let (observer, log) = recorder();
        subject.observable().subscribe(observer);

        assert_eq!(*log.lock().unwrap(), vec!["next:1", "next:2", "complete"]);
    }

    #[test]
    fn if_empty_switches_to_fallback() {
        let (observer, log) = recorder();
        Observable::<u32>::empty()
            .if_empty(Observable::from_value(9))
            .subscribe(observer);

        assert_eq!(*log.lock().unwrap(), vec!["next:9", "complete"]);
    }
}
