//! Process-wide store for key material.
//!
//! Read-preferring locking: lookups on the hot secure-endpoint path take
//! the read lock, writes happen only at startup and through the key
//! utility endpoints.

use std::collections::HashMap;
use std::sync::RwLock;

/// Name under which the server's RSA private key is stored at startup.
pub const PRIVATE_KEY: &str = "privateKey";

#[derive(Default)]
pub struct KeyStore {
    store: RwLock<HashMap<String, String>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a key, overwriting any previous value.
    pub fn set(&self, name: &str, value: &str) {
        self.store
            .write()
            .unwrap()
            .insert(name.to_owned(), value.to_owned());
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.store.read().unwrap().get(name).cloned()
    }
}
