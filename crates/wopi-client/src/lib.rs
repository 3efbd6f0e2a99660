//! Typed client for the subset of the WOPI protocol the bridge needs:
//! file metadata/content retrieval and the lock lifecycle (`LOCK`,
//! `UNLOCK`, `REFRESH_LOCK`, `GET_LOCK`, `PUT_RELATIVE`).
//!
//! This crate is a thin translator over HTTP; it carries no bridge-level
//! policy (save scheduling, adapter dispatch, registry bookkeeping all live
//! above it).

mod client;
mod error;
mod filemeta;
mod lock;
mod token;

pub use client::{jsonify, LockOverrides, WopiClient};
pub use error::WopiError;
pub use filemeta::FileMeta;
pub use lock::{WopiLock, DIRTY_DIGEST};
pub use token::short_token;
