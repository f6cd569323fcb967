//! Scripted data-source runtime.
//!
//! Each data source is a Lua script loaded into its own interpreter and
//! driven by a dedicated worker thread: one callback at a time, paced by
//! a per-source rate limiter, talking to the engine only through the
//! narrow capability surface registered into its globals. The engine
//! sees every source as a [`sprawl_engine::service::Service`].

/// Error definitions and conversions for the script runtime.
pub mod error;
/// The shared HTTP response cache consulted by `request` and `scrape`.
pub mod cache;
/// Script loading, callback dispatch and the capability surface.
pub mod script;

pub use script::{ScriptHost, ScriptService};
