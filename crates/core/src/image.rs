//! Image embedding production with a small LRU cache.
//!
//! Vision-tower invocations are expensive and the same image routinely
//! appears across consecutive requests (multi-turn conversations), so
//! embeddings are cached by a 64-bit hash of the raw bytes. The cache is a
//! fixed array of four entries; a hit refreshes the entry's timestamp and a
//! miss overwrites the least-recently-used entry.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;

use crate::backend::{BackendError, Input, VisionEmbedder};

const IMAGE_CACHE_SIZE: usize = 4;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("received zero length image")]
    EmptyImage,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Default)]
struct ImageCacheEntry {
    key: u64,
    embed: Vec<Vec<f32>>,
    last_used: Option<Instant>,
}

pub struct ImageContext {
    embedder: Arc<dyn VisionEmbedder>,
    cache: Mutex<Vec<ImageCacheEntry>>,
}

impl ImageContext {
    pub fn new(embedder: Arc<dyn VisionEmbedder>) -> Self {
        let cache = (0..IMAGE_CACHE_SIZE).map(|_| ImageCacheEntry::default()).collect();
        Self {
            embedder,
            cache: Mutex::new(cache),
        }
    }

    /// Embedding batch capacity for the active vision model.
    pub fn batch_size(&self, configured: usize) -> usize {
        self.embedder.batch_size(configured)
    }

    pub fn embed_size(&self) -> usize {
        self.embedder.embed_size()
    }

    /// Whether decoding `inputs` needs image↔text cross-attention: only
    /// when the vision model requires it and an embedding is present.
    pub fn need_cross_attention(&self, inputs: &[Input]) -> bool {
        self.embedder.uses_cross_attention() && inputs.iter().any(Input::is_embed)
    }

    /// Produce embedding vectors for `data`, consulting the cache first.
    ///
    /// The lock is held across the miss path, serializing embedder
    /// invocations; embeddings are large and the embedder is rarely called.
    pub fn new_embed(&self, data: &[u8], aspect_ratio_id: i32) -> Result<Vec<Vec<f32>>, ImageError> {
        if data.is_empty() {
            return Err(ImageError::EmptyImage);
        }

        let hash = hash_image(data);
        let mut cache = self.cache.lock().unwrap();

        if let Some(entry) = cache.iter_mut().find(|e| e.key == hash && e.last_used.is_some()) {
            tracing::debug!("loading image embeddings from cache");
            entry.last_used = Some(Instant::now());
            return Ok(entry.embed.clone());
        }

        let embed = self.embedder.embed(data, aspect_ratio_id)?;

        // Store at a matching key if present, otherwise at the LRU entry.
        let mut best = 0;
        for (i, entry) in cache.iter().enumerate() {
            if entry.key == hash {
                best = i;
                break;
            }
            if entry.last_used < cache[best].last_used {
                best = i;
            }
        }
        tracing::debug!(entry = best, "storing image embeddings in cache");
        cache[best] = ImageCacheEntry {
            key: hash,
            embed: embed.clone(),
            last_used: Some(Instant::now()),
        };

        Ok(embed)
    }
}

fn hash_image(data: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(data);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEmbedder;

    fn context(embedder: &Arc<MockEmbedder>) -> ImageContext {
        ImageContext::new(embedder.clone() as Arc<dyn VisionEmbedder>)
    }

    #[test]
    fn empty_image_is_rejected() {
        let embedder = Arc::new(MockEmbedder::new(1, 4));
        let ctx = context(&embedder);
        assert!(matches!(ctx.new_embed(&[], 0), Err(ImageError::EmptyImage)));
    }

    #[test]
    fn cache_hit_skips_the_embedder() {
        let embedder = Arc::new(MockEmbedder::new(2, 4));
        let ctx = context(&embedder);

        let first = ctx.new_embed(&[1, 2, 3], 0).unwrap();
        let second = ctx.new_embed(&[1, 2, 3], 0).unwrap();
        assert_eq!(first, second);
        assert_eq!(embedder.calls(), 1);
    }

    #[test]
    fn lru_entry_is_overwritten_at_capacity() {
        let embedder = Arc::new(MockEmbedder::new(1, 4));
        let ctx = context(&embedder);

        for b in 1..=4u8 {
            ctx.new_embed(&[b], 0).unwrap();
        }
        assert_eq!(embedder.calls(), 4);

        // Refresh image 1 so image 2 becomes the LRU victim.
        ctx.new_embed(&[1], 0).unwrap();
        assert_eq!(embedder.calls(), 4);

        ctx.new_embed(&[5], 0).unwrap();
        assert_eq!(embedder.calls(), 5);

        // Image 1 is still cached; image 2 was evicted.
        ctx.new_embed(&[1], 0).unwrap();
        assert_eq!(embedder.calls(), 5);
        ctx.new_embed(&[2], 0).unwrap();
        assert_eq!(embedder.calls(), 6);
    }

    #[test]
    fn cross_attention_requires_embeddings_present() {
        let embedder = Arc::new(MockEmbedder::new(1, 4).with_cross_attention());
        let ctx = context(&embedder);

        assert!(!ctx.need_cross_attention(&[Input::Token(1)]));
        assert!(ctx.need_cross_attention(&[Input::Token(1), Input::Embed(vec![0.0; 4])]));

        let plain = Arc::new(MockEmbedder::new(1, 4));
        let ctx = context(&plain);
        assert!(!ctx.need_cross_attention(&[Input::Embed(vec![0.0; 4])]));
    }
}
