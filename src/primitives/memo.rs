use std::sync::{Arc, Mutex};

use crate::cache::lock::mutex_lock;
use crate::runtime::descriptor::{CacheConfig, ConcreteRequest, OperationDescriptor, Variables};
use crate::runtime::disposable::Disposable;

use super::reactive::Signal;

const SOURCE: &str = "primitives::memo";

/// Hands out the same descriptor for equal variables, even when the variable
/// map was rebuilt between calls.
pub struct OperationMemo {
    request: Arc<ConcreteRequest>,
    last: Mutex<Option<OperationDescriptor>>,
}

impl OperationMemo {
    pub fn new(request: Arc<ConcreteRequest>) -> Self {
        Self {
            request,
            last: Mutex::new(None),
        }
    }

    pub fn descriptor(&self, variables: &Variables, cache_config: CacheConfig) -> OperationDescriptor {
        let mut last = mutex_lock(&self.last, SOURCE, "descriptor");
        if let Some(previous) = last.as_ref()
            && previous.request.variables == *variables
            && previous.request.cache_config == cache_config
        {
            return previous.clone();
        }
        let descriptor =
            OperationDescriptor::with_cache_config(&self.request, variables.clone(), cache_config);
        *last = Some(descriptor.clone());
        descriptor
    }
}

/// Derives a descriptor signal from a variables signal. The derived signal
/// only fires when the variables change by value.
pub fn create_memo_operation_descriptor(
    request: Arc<ConcreteRequest>,
    variables: &Signal<Variables>,
    cache_config: CacheConfig,
) -> (Signal<OperationDescriptor>, Disposable) {
    let memo = Arc::new(OperationMemo::new(request));
    let derived = Signal::new(variables.with(|current| memo.descriptor(current, cache_config)));
    let target = derived.clone();
    let subscription = variables.subscribe(move |next| {
        target.set_if_changed(memo.descriptor(next, cache_config));
    });
    (derived, subscription)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn vars(id: &str) -> Variables {
        let mut variables = Variables::new();
        variables.insert("id".into(), json!(id));
        variables
    }

    #[test]
    fn rebuilt_variables_reuse_the_descriptor() {
        let memo = OperationMemo::new(Arc::new(ConcreteRequest::query("UserQuery", vec![])));

        let first = memo.descriptor(&vars("1"), CacheConfig::default());
        let again = memo.descriptor(&vars("1"), CacheConfig::default());
        let other = memo.descriptor(&vars("2"), CacheConfig::default());

        assert!(Arc::ptr_eq(&first.request, &again.request));
        assert!(!Arc::ptr_eq(&first.request, &other.request));
    }

    #[test]
    fn derived_signal_ignores_equal_writes() {
        let variables = Signal::new(vars("1"));
        let (descriptor, _subscription) = create_memo_operation_descriptor(
            Arc::new(ConcreteRequest::query("UserQuery", vec![])),
            &variables,
            CacheConfig::default(),
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let _listener = descriptor.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        variables.set(vars("1"));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        variables.set(vars("2"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(descriptor.get().request.variables, vars("2"));
    }
}
