//! Client-side sync and caching core.
//!
//! - [`sync::MessageSyncEngine`] keeps the conversation in step with the
//!   remote store and chains a completion after every user message.
//! - [`cache::DocumentCacheManager`] is a memory + disk cache of decoded
//!   document content with per-identity request coalescing.
//! - [`upload::UploadCoordinator`] runs the per-document upload state machine.
//! - [`index::DocumentIndex`] merges the working directory with remote
//!   metadata into one searchable catalog.

pub mod cache;
pub mod completion;
pub mod config;
pub mod index;
pub mod remote;
pub mod sync;
pub mod telemetry;
pub mod types;
pub mod upload;
