//! Reactive bindings between a fine-grained UI substrate and a normalized
//! GraphQL store.
//!
//! The crate is organised leaves first:
//!
//! - [`cache`]: the capacity-bounded LRU map every resource cache builds on.
//! - [`runtime`]: the store/network contract ([`runtime::Environment`]) plus
//!   an in-memory reference environment.
//! - [`resource`]: retention, fragment and query resources, scoped to one
//!   environment through [`resource::RelayContext`].
//! - [`primitives`]: the user-facing reactive bindings.

pub mod cache;
pub mod config;
pub mod error;
pub mod primitives;
pub mod resource;
pub mod runtime;
pub mod telemetry;

pub use error::{InitError, RelayError};
pub use resource::RelayContext;
