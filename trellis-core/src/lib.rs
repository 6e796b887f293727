//! Trellis core library: cross-reference resolution and incremental graph sync.
//!
//! The main entry point is [`sync::SyncEngine`], which runs one
//! Fetch → Filter → Upsert → Resolve → Derive pass over a [`store::GraphStore`].

pub mod config;
pub mod error;
pub mod hierarchy;
pub mod patterns;
pub mod progress;
pub mod resolve;
pub mod retention;
pub mod retry;
pub mod source;
pub mod store;
pub mod sync;
pub mod types;
pub mod upsert;
