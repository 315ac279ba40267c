//! Shared test utilities for kvserve-core.
//!
//! Provides a scriptable [`MockBackend`] and [`MockEmbedder`] so the
//! scheduler, cache and HTTP layers can be exercised without a real model.

mod mock_backend;

pub use mock_backend::{MockBackend, MockEmbedder, EOG_TOKEN};
