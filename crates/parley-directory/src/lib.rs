//! parley-directory — the rendezvous service.
//!
//! Clients PUT their record every few seconds and GET the full list of live
//! peers. Records expire unless refreshed; nothing is relayed through here.

pub mod api;
pub mod registry;

pub use api::ApiState;
pub use registry::ExpiringRegistry;
