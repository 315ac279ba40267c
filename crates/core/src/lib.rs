//! kvserve-core: a concurrent sequence scheduler over a shared KV cache.
//!
//! The crate multiplexes a single model backend across many in-flight
//! requests. Each request becomes a [`sequence::Sequence`] bound to one
//! [`cache::InputCacheSlot`]; the [`scheduler::Scheduler`] interleaves the
//! live sequences into shared decode batches, streams sampled pieces back
//! through per-sequence channels, and reclaims KV space through prefix
//! reuse, context shifting and slot eviction.
//!
//! The tensor backend is consumed through the [`backend::ModelBackend`]
//! contract; an adapter over llama.cpp bindings is available behind the
//! `llama` feature.

pub mod backend;
pub mod cache;
pub mod image;
pub mod scheduler;
pub mod sequence;
pub mod testing;
