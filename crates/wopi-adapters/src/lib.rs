//! The app-adapter contract and the adapters that implement it.
//!
//! An adapter is the only place that knows how to speak to one particular
//! collaborative app; everything above this crate (the bridge's registry and
//! coordinator) works purely in terms of [`AppAdapter`].

mod adapter;
mod error;
mod markdown;

pub use adapter::AppAdapter;
pub use error::AdapterError;
pub use markdown::MarkdownAdapter;
