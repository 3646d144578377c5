//! In-memory reference environment: a normalized record store and a
//! scripted network behind the [`Environment`](crate::runtime::Environment)
//! contract.

mod environment;
mod network;
mod store;

pub use environment::{EnvironmentOptions, MemoryEnvironment};
pub use network::{Network, ScriptedNetwork};
