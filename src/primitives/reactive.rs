//! Minimal reactive substrate: observable cells and cleanup scopes.
//!
//! Listeners run synchronously on write, in subscription order, after the
//! cell's lock has been released.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::lock::mutex_lock;
use crate::error::RelayError;
use crate::resource::RelayContext;
use crate::runtime::disposable::Disposable;

use super::suspense::SuspenseBoundary;

const SOURCE: &str = "primitives::reactive";

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SignalState<T> {
    value: T,
    listeners: Vec<(u64, Listener<T>)>,
}

/// A shared value cell that notifies listeners when written.
pub struct Signal<T> {
    state: Arc<Mutex<SignalState<T>>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Signal<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Arc::new(Mutex::new(SignalState {
                value,
                listeners: Vec::new(),
            })),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn get(&self) -> T {
        mutex_lock(&self.state, SOURCE, "signal_get").value.clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&mutex_lock(&self.state, SOURCE, "signal_with").value)
    }

    pub fn set(&self, value: T) {
        let listeners = {
            let mut state = mutex_lock(&self.state, SOURCE, "signal_set");
            state.value = value.clone();
            state
                .listeners
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect::<Vec<_>>()
        };
        for listener in listeners {
            listener(&value);
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut value = self.get();
        f(&mut value);
        self.set(value);
    }

    /// Runs `listener` on every subsequent write until the handle is disposed.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Disposable {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        mutex_lock(&self.state, SOURCE, "signal_subscribe")
            .listeners
            .push((id, Arc::new(listener)));
        let state = self.state.clone();
        Disposable::new(move || {
            mutex_lock(&state, SOURCE, "signal_unsubscribe")
                .listeners
                .retain(|(listener_id, _)| *listener_id != id);
        })
    }
}

impl<T: Clone + PartialEq + Send + 'static> Signal<T> {
    /// Writes only when the value differs, so listeners see real changes.
    pub fn set_if_changed(&self, value: T) -> bool {
        if self.with(|current| *current == value) {
            return false;
        }
        self.set(value);
        true
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ScopeState {
    cleanups: Mutex<Vec<Cleanup>>,
    disposed: AtomicBool,
}

/// Owner of cleanup callbacks; disposing runs them newest first.
#[derive(Clone, Default)]
pub struct Scope {
    state: Arc<ScopeState>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` to run on disposal. A disposed scope runs it right away.
    pub fn on_cleanup(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_disposed() {
            f();
            return;
        }
        mutex_lock(&self.state.cleanups, SOURCE, "on_cleanup").push(Box::new(f));
    }

    /// Ties a disposable to this scope.
    pub fn own(&self, mut disposable: Disposable) {
        self.on_cleanup(move || disposable.dispose());
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }

    pub fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let cleanups = std::mem::take(&mut *mutex_lock(&self.state.cleanups, SOURCE, "dispose"));
        for cleanup in cleanups.into_iter().rev() {
            cleanup();
        }
    }
}

/// Tri-state value exposed by the bindings: at most one of data, error and
/// pending is meaningful at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct DataState<T> {
    pub data: Option<T>,
    pub error: Option<RelayError>,
    pub pending: bool,
}

impl<T> Default for DataState<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            pending: false,
        }
    }
}

impl<T: Clone> DataState<T> {
    pub fn pending() -> Self {
        Self {
            pending: true,
            ..Self::default()
        }
    }

    pub fn ready(data: T) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn failed(error: RelayError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// The data, or the recorded error.
    pub fn read(&self) -> Result<Option<T>, RelayError> {
        match &self.error {
            Some(error) => Err(error.clone()),
            None => Ok(self.data.clone()),
        }
    }

    /// Last known data regardless of error or pending state.
    pub fn latest(&self) -> Option<&T> {
        self.data.as_ref()
    }
}

/// What every primitive is created under: the environment-scoped context,
/// the cleanup scope of the owning computation and the nearest suspense
/// boundary.
#[derive(Clone)]
pub struct Owner {
    context: RelayContext,
    scope: Scope,
    boundary: SuspenseBoundary,
}

impl Owner {
    pub fn new(context: RelayContext) -> Self {
        Self {
            context,
            scope: Scope::new(),
            boundary: SuspenseBoundary::new(),
        }
    }

    /// Same context and boundary with a fresh cleanup scope, disposed along
    /// with this one.
    pub fn child(&self) -> Self {
        let scope = Scope::new();
        let nested = scope.clone();
        self.scope.on_cleanup(move || nested.dispose());
        Self {
            context: self.context.clone(),
            scope,
            boundary: self.boundary.clone(),
        }
    }

    /// Same context and scope under a different suspense boundary.
    pub fn with_boundary(&self, boundary: SuspenseBoundary) -> Self {
        Self {
            boundary,
            ..self.clone()
        }
    }

    pub fn context(&self) -> &RelayContext {
        &self.context
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn boundary(&self) -> &SuspenseBoundary {
        &self.boundary
    }

    pub fn is_mounted(&self) -> bool {
        !self.scope.is_disposed()
    }
}
