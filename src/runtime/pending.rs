//! Pending markers returned by reads that must wait for the network, a live
//! resolver or a secondary query.
//!
//! A read returns [`Resolution::Pending`] instead of suspending; callers loop
//! "read, await, read again" via [`resolve`] until a value is produced.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared, join_all};

use crate::error::RelayError;

/// A cloneable future that settles exactly once.
#[derive(Clone)]
pub struct Pending {
    inner: Shared<BoxFuture<'static, ()>>,
    settled: Vec<Arc<AtomicBool>>,
}

/// Settles the paired [`Pending`]. Dropping the resolver settles it too.
pub struct Resolver {
    sender: Option<oneshot::Sender<()>>,
    settled: Arc<AtomicBool>,
}

impl Resolver {
    pub fn resolve(mut self) {
        self.settle();
    }

    fn settle(&mut self) {
        self.settled.store(true, Ordering::SeqCst);
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(());
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.settle();
    }
}

impl Pending {
    pub fn channel() -> (Pending, Resolver) {
        let (sender, receiver) = oneshot::channel::<()>();
        let settled = Arc::new(AtomicBool::new(false));
        let pending = Pending {
            inner: receiver.map(|_| ()).boxed().shared(),
            settled: vec![settled.clone()],
        };
        let resolver = Resolver {
            sender: Some(sender),
            settled,
        };
        (pending, resolver)
    }

    pub fn resolved() -> Pending {
        Pending {
            inner: futures::future::ready(()).boxed().shared(),
            settled: Vec::new(),
        }
    }

    /// Settles once every input has settled.
    pub fn all(pendings: impl IntoIterator<Item = Pending>) -> Pending {
        let pendings: Vec<Pending> = pendings.into_iter().collect();
        let settled = pendings
            .iter()
            .flat_map(|pending| pending.settled.iter().cloned())
            .collect();
        Pending {
            inner: join_all(pendings).map(|_| ()).boxed().shared(),
            settled,
        }
    }

    /// Runs `f` when this settles, before anyone awaiting the result resumes.
    pub fn then(self, f: impl FnOnce() + Send + 'static) -> Pending {
        let settled = self.settled.clone();
        Pending {
            inner: self.inner.map(move |_| f()).boxed().shared(),
            settled,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.inner.peek().is_some() || self.settled.iter().all(|flag| flag.load(Ordering::SeqCst))
    }
}

impl Future for Pending {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Outcome of a suspense-aware read.
#[derive(Debug, Clone)]
pub enum Resolution<T> {
    Ready(T),
    Pending(Pending),
}

impl<T> Resolution<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Resolution::Pending(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Resolution::Ready(value) => Some(value),
            Resolution::Pending(_) => None,
        }
    }
}

/// Re-invokes `read` until it produces a value, awaiting each pending marker.
pub async fn resolve<T>(
    mut read: impl FnMut() -> Result<Resolution<T>, RelayError>,
) -> Result<T, RelayError> {
    loop {
        match read()? {
            Resolution::Ready(value) => return Ok(value),
            Resolution::Pending(pending) => pending.await,
        }
    }
}
