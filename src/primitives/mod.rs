//! User-facing reactive bindings.
//!
//! Every primitive takes an [`Owner`]: the context it reads through, the
//! scope whose disposal releases what it retained, and the suspense boundary
//! its pending reads are reported to.

pub mod active;
pub mod fetch_tracker;
pub mod fragment;
pub mod lazy_query;
pub mod load_query;
pub mod memo;
pub mod mutation;
pub mod pagination;
pub mod preloaded;
pub mod query;
pub mod query_loader;
pub mod reactive;
pub mod refetchable;
pub mod subscription;
pub mod suspense;

pub use active::is_operation_node_active;
pub use fetch_tracker::FetchTracker;
pub use fragment::{FragmentBinding, FragmentNode, create_fragment};
pub use lazy_query::{LazyLoadQueryOptions, LazyQuery, create_lazy_load_query};
pub use load_query::{LoadQueryOptions, PreloadedQuery, load_query};
pub use memo::{OperationMemo, create_memo_operation_descriptor};
pub use mutation::{Mutation, MutationConfig, create_mutation};
pub use pagination::{
    ConnectionState, Direction, PaginationFragment, create_pagination_fragment,
    get_connection_state, get_pagination_variables,
};
pub use preloaded::create_preloaded_query;
pub use query::{QueryNode, QueryNodeOptions, create_query_node};
pub use query_loader::{QueryLoader, create_query_loader};
pub use reactive::{DataState, Owner, Scope, Signal};
pub use refetchable::{
    RefetchCallback, RefetchOptions, RefetchableFragment, create_refetchable_fragment,
    refetch_variables,
};
pub use subscription::{SubscriptionConfig, create_subscription};
pub use suspense::SuspenseBoundary;
