//! Render-then-wait-then-retry, as an explicit boundary object.

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::cache::lock::mutex_lock;
use crate::error::RelayError;
use crate::runtime::pending::{Pending, Resolution};

const SOURCE: &str = "primitives::suspense";

/// Collects the pending markers of reads issued beneath it.
#[derive(Clone, Default)]
pub struct SuspenseBoundary {
    pending: Arc<Mutex<Vec<Pending>>>,
}

impl SuspenseBoundary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pending: Pending) {
        mutex_lock(&self.pending, SOURCE, "register").push(pending);
    }

    /// Registers the marker of a pending resolution and passes the value of a
    /// ready one through.
    pub fn track<T>(&self, resolution: Resolution<T>) -> Option<T> {
        match resolution {
            Resolution::Ready(value) => Some(value),
            Resolution::Pending(pending) => {
                self.register(pending);
                None
            }
        }
    }

    /// Whether a fallback should be shown. Settled markers are dropped.
    pub fn is_pending(&self) -> bool {
        let mut pending = mutex_lock(&self.pending, SOURCE, "is_pending");
        pending.retain(|marker| !marker.is_settled());
        !pending.is_empty()
    }

    /// Awaits everything registered so far.
    pub async fn settle(&self) {
        let markers = std::mem::take(&mut *mutex_lock(&self.pending, SOURCE, "settle"));
        if markers.is_empty() {
            return;
        }
        trace!(
            target_module = SOURCE,
            count = markers.len(),
            "Waiting on pending reads"
        );
        Pending::all(markers).await;
    }

    /// Runs `read` until it yields a value, registering each pending marker
    /// with this boundary while it is outstanding.
    pub async fn read<T>(
        &self,
        mut read: impl FnMut() -> Result<Resolution<T>, RelayError>,
    ) -> Result<T, RelayError> {
        loop {
            match read()? {
                Resolution::Ready(value) => return Ok(value),
                Resolution::Pending(pending) => {
                    self.register(pending);
                    self.settle().await;
                }
            }
        }
    }
}
