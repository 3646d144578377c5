//! The store/network contract the resource layer is written against, and the
//! value types that cross it.

pub mod data;
pub mod descriptor;
pub mod disposable;
pub mod environment;
pub mod memory;
pub mod observable;
pub mod pending;
pub mod policy;
pub mod snapshot;

pub use data::{Data, recycle_nodes_into};
pub use descriptor::{
    ConcreteRequest, FragmentKey, FragmentRef, OperationDescriptor, ReaderFragment,
    RequestDescriptor, Selector, SingularSelector, Variables,
};
pub use disposable::Disposable;
pub use environment::{Environment, PendingOperations, SnapshotCallback};
pub use observable::{Observable, Observer, ReplaySubject, Sink, Subscription};
pub use pending::{Pending, Resolution, Resolver, resolve};
pub use policy::{Epoch, FetchPolicy, RenderPolicy};
pub use snapshot::{GraphQlResponse, OperationAvailability, Snapshot};
