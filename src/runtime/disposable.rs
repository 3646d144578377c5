use std::fmt;

type DisposeFn = Box<dyn FnOnce() + Send>;

/// A release handle. Disposing runs the release at most once.
#[derive(Default)]
pub struct Disposable {
    release: Option<DisposeFn>,
}

impl Disposable {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn noop() -> Self {
        Self::default()
    }

    /// Combines several handles into one that disposes them in order.
    pub fn all(disposables: Vec<Disposable>) -> Self {
        Self::new(move || {
            for mut disposable in disposables {
                disposable.dispose();
            }
        })
    }

    pub fn dispose(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.release.is_none()
    }
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposable")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn dispose_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut disposable = Disposable::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        disposable.dispose();
        disposable.dispose();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(disposable.is_disposed());
    }
}
