//! Resource layer: retention, query and fragment caches scoped to one
//! environment through [`RelayContext`].

mod client_edge;
pub mod config;
mod context;
pub mod fragment;
pub mod query;
pub mod query_cache;
pub mod suspense;

pub use config::ResourceConfig;
pub use context::RelayContext;
pub use fragment::{FragmentResource, FragmentResult, FragmentSnapshot, MissedUpdates};
pub use query::{PrepareOptions, QueryResource, QueryResult, query_cache_identifier};
pub use query_cache::{QueryReference, QueryReferenceCache};
pub use suspense::{DEFAULT_TEMPORARY_RETAIN, RetainFn, SuspenseResource};
