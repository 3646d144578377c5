use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Locks `lock`, recovering the guard if a previous holder panicked.
///
/// Every shared structure in this crate keeps its invariants across a single
/// critical section, so a poisoned guard is still structurally sound.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned lock"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn recovers_poisoned_mutex() {
        let lock = Mutex::new(vec![1_u32]);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let mut guard = lock.lock().expect("lock should not be poisoned yet");
            guard.push(2);
            panic!("poison the lock");
        }));

        assert!(lock.is_poisoned());
        let guard = mutex_lock(&lock, "cache::lock", "recovers_poisoned_mutex");
        assert_eq!(*guard, vec![1, 2]);
    }
}
