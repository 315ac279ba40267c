//! Pool of KV cache slots shared across concurrent sequences.
//!
//! The backend's KV storage is partitioned into `parallel` slots of
//! `kv_size / parallel` tokens each. A slot remembers the inputs currently
//! resident in its KV partition so a new prompt can reuse the longest
//! matching prefix instead of re-decoding it. Two selection policies exist:
//! single-user (pick the free slot with the longest prefix) and multi-user
//! (additionally fork a busy slot's prefix into the least-recently-used free
//! slot).

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::backend::{Input, ModelBackend};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("must have at least one kv cache entry per parallel sequence (kv: {kv_size} parallel: {parallel})")]
    NoCtxPerSlot { kv_size: usize, parallel: usize },

    #[error("no available cache slots")]
    NoSlots,

    #[error("unable to shift context - keep exceeds context (keep: {num_keep} context: {num_ctx})")]
    KeepExceedsContext { num_keep: usize, num_ctx: usize },

    #[error("unable to remove old kv cache entries (id: {id}, keep: {num_keep} discard: {discard})")]
    ShiftRemoveFailed {
        id: usize,
        num_keep: usize,
        discard: usize,
    },
}

/// One KV cache partition. `inputs` mirrors the backend-side KV contents
/// for sequence id `id`, index by index; `in_use` implies an exclusive
/// writer.
pub struct InputCacheSlot {
    pub id: usize,
    pub inputs: Vec<Input>,
    pub in_use: bool,
    pub last_used: Option<Instant>,
}

pub struct InputCache {
    num_ctx: usize,
    slots: Vec<InputCacheSlot>,
    multi_user: bool,
    backend: Arc<dyn ModelBackend>,
}

impl InputCache {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        kv_size: usize,
        num_slots: usize,
        multi_user: bool,
    ) -> Result<Self, CacheError> {
        if num_slots == 0 || kv_size / num_slots < 1 {
            return Err(CacheError::NoCtxPerSlot {
                kv_size,
                parallel: num_slots,
            });
        }

        let slots = (0..num_slots)
            .map(|id| InputCacheSlot {
                id,
                inputs: Vec::new(),
                in_use: false,
                last_used: None,
            })
            .collect();

        Ok(Self {
            num_ctx: kv_size / num_slots,
            slots,
            multi_user,
            backend,
        })
    }

    /// Context window available to each sequence.
    pub fn num_ctx(&self) -> usize {
        self.num_ctx
    }

    pub fn slot(&self, id: usize) -> &InputCacheSlot {
        &self.slots[id]
    }

    pub fn slot_mut(&mut self, id: usize) -> &mut InputCacheSlot {
        &mut self.slots[id]
    }

    /// Release a slot at sequence finalization. The resident inputs stay in
    /// place for prefix reuse by later prompts.
    pub fn release(&mut self, id: usize) {
        self.slots[id].in_use = false;
    }

    /// Select a slot for `prompt`, trim the reused prefix from both the
    /// slot and the prompt, and mark the slot busy. Returns the slot id and
    /// the prompt suffix that still needs decoding.
    pub fn load_slot(
        &mut self,
        mut prompt: Vec<Input>,
        cache_prompt: bool,
    ) -> Result<(usize, Vec<Input>), CacheError> {
        let (id, mut num_past) = if self.multi_user {
            self.find_best_slot(&prompt)?
        } else {
            self.find_longest_slot(&prompt)?
        };

        if !cache_prompt {
            num_past = 0;
        }

        self.slots[id].in_use = true;
        self.slots[id].last_used = Some(Instant::now());

        if num_past == prompt.len() && num_past > 0 {
            // Leave one input to decode so there are logits to sample from.
            num_past -= 1;
        }

        if !self.backend.kv_cache_seq_rm(id, num_past as i32, -1) {
            // Fallback for backends that cannot erase partial ranges.
            self.backend.kv_cache_seq_rm(id, 0, -1);
            num_past = 0;
        }

        tracing::debug!(
            id,
            cached = self.slots[id].inputs.len(),
            prompt = prompt.len(),
            used = num_past,
            remaining = prompt.len() - num_past,
            "loading cache slot"
        );

        let remaining = prompt.split_off(num_past);
        self.slots[id].inputs.truncate(num_past);

        Ok((id, remaining))
    }

    /// Free slot with the longest common prefix; ties broken by slot order.
    fn find_longest_slot(&self, prompt: &[Input]) -> Result<(usize, usize), CacheError> {
        let mut longest: i64 = -1;
        let mut longest_slot = None;

        for (i, slot) in self.slots.iter().enumerate() {
            if slot.in_use {
                continue;
            }
            let count = count_common_prefix(&slot.inputs, prompt) as i64;
            if count > longest {
                longest = count;
                longest_slot = Some(i);
            }
        }

        longest_slot
            .map(|i| (i, longest as usize))
            .ok_or(CacheError::NoSlots)
    }

    /// Multi-user selection: reuse the best-prefix slot when it is free and
    /// its whole contents match, otherwise fork that prefix into the
    /// least-recently-used free slot.
    fn find_best_slot(&mut self, prompt: &[Input]) -> Result<(usize, usize), CacheError> {
        let mut longest: i64 = -1;
        let mut longest_slot = None;
        let mut oldest_slot: Option<usize> = None;

        for (i, slot) in self.slots.iter().enumerate() {
            let count = count_common_prefix(&slot.inputs, prompt) as i64;
            if count > longest {
                longest = count;
                longest_slot = Some(i);
            }
            if !slot.in_use {
                let older = match oldest_slot {
                    None => true,
                    Some(o) => match (slot.last_used, self.slots[o].last_used) {
                        (None, Some(_)) => true,
                        (Some(a), Some(b)) => a < b,
                        _ => false,
                    },
                };
                if older {
                    oldest_slot = Some(i);
                }
            }
        }

        let longest = longest.max(0) as usize;

        if let Some(best) = longest_slot {
            if longest == self.slots[best].inputs.len() && !self.slots[best].in_use {
                return Ok((best, longest));
            }
        }

        let Some(oldest) = oldest_slot else {
            return Err(CacheError::NoSlots);
        };

        if !self.slots[oldest].inputs.is_empty() {
            tracing::debug!(
                id = oldest,
                inputs = self.slots[oldest].inputs.len(),
                "evicting cache slot"
            );
        }

        if longest > 0 {
            if let Some(donor) = longest_slot.filter(|&d| d != oldest) {
                tracing::debug!(
                    src = donor,
                    dst = oldest,
                    inputs = longest,
                    total = self.slots[donor].inputs.len(),
                    "forking cache slot"
                );
                let prefix = self.slots[donor].inputs[..longest].to_vec();
                self.slots[oldest].inputs = prefix;

                self.backend.kv_cache_seq_rm(oldest, 0, -1);
                self.backend.kv_cache_seq_cp(donor, oldest, 0, longest as i32);

                return Ok((oldest, longest));
            }
        }

        Ok((oldest, count_common_prefix(&self.slots[oldest].inputs, prompt)))
    }

    /// Discard a mid-window range of a slot's KV entries so that one more
    /// input fits, renumbering the surviving tail.
    pub fn shift_slot(&mut self, id: usize, num_keep: usize) -> Result<(), CacheError> {
        if num_keep >= self.num_ctx {
            return Err(CacheError::KeepExceedsContext {
                num_keep,
                num_ctx: self.num_ctx,
            });
        }

        let input_len = self.slots[id].inputs.len();
        let discard = self.shift_discard(input_len, num_keep);
        if discard == 0 {
            return Ok(());
        }

        tracing::debug!(
            id,
            limit = self.num_ctx,
            input = input_len,
            keep = num_keep,
            discard,
            "context limit hit - shifting"
        );

        if !self
            .backend
            .kv_cache_seq_rm(id, num_keep as i32, (num_keep + discard) as i32)
        {
            return Err(CacheError::ShiftRemoveFailed {
                id,
                num_keep,
                discard,
            });
        }
        self.backend.kv_cache_seq_add(
            id,
            (num_keep + discard) as i32,
            input_len as i32,
            -(discard as i32),
        );

        self.slots[id].inputs.drain(num_keep..num_keep + discard);

        Ok(())
    }

    /// Number of inputs to discard so that half of the shiftable window
    /// (but at least one entry) becomes free.
    fn shift_discard(&self, input_len: usize, num_keep: usize) -> usize {
        let target_free = ((self.num_ctx - num_keep) / 2).max(1);
        let current_free = self.num_ctx.saturating_sub(input_len);
        target_free.saturating_sub(current_free)
    }
}

/// Length of the common prefix of `a` and `b` under structural input
/// equality.
fn count_common_prefix(a: &[Input], b: &[Input]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;

    fn tokens(ids: &[i32]) -> Vec<Input> {
        ids.iter().map(|&t| Input::Token(t)).collect()
    }

    fn cache(kv_size: usize, slots: usize, multi_user: bool) -> InputCache {
        InputCache::new(Arc::new(MockBackend::new()), kv_size, slots, multi_user).unwrap()
    }

    #[test]
    fn rejects_zero_context_per_slot() {
        let backend = Arc::new(MockBackend::new());
        assert!(matches!(
            InputCache::new(backend, 3, 4, false),
            Err(CacheError::NoCtxPerSlot { .. })
        ));
    }

    #[test]
    fn common_prefix_counting() {
        assert_eq!(count_common_prefix(&tokens(&[1, 2, 3]), &tokens(&[1, 2, 4])), 2);
        assert_eq!(count_common_prefix(&tokens(&[]), &tokens(&[1])), 0);
        assert_eq!(count_common_prefix(&tokens(&[1, 2]), &tokens(&[1, 2, 3])), 2);
        // Embedding inputs compare element-wise.
        let a = vec![Input::Token(1), Input::Embed(vec![0.5, 0.25])];
        let b = vec![Input::Token(1), Input::Embed(vec![0.5, 0.25]), Input::Token(2)];
        assert_eq!(count_common_prefix(&a, &b), 2);
        let c = vec![Input::Token(1), Input::Embed(vec![0.5])];
        assert_eq!(count_common_prefix(&a, &c), 1);
    }

    #[test]
    fn single_user_prefers_longest_prefix() {
        let mut c = cache(16, 2, false);
        c.slot_mut(0).inputs = tokens(&[1, 2]);
        c.slot_mut(1).inputs = tokens(&[1, 2, 3, 4]);

        let (id, rest) = c.load_slot(tokens(&[1, 2, 3, 9]), true).unwrap();
        assert_eq!(id, 1);
        assert_eq!(rest, tokens(&[9]));
        assert_eq!(c.slot(1).inputs, tokens(&[1, 2, 3]));
        assert!(c.slot(1).in_use);
    }

    #[test]
    fn single_user_fails_when_all_slots_busy() {
        let mut c = cache(16, 1, false);
        c.slot_mut(0).in_use = true;
        assert!(matches!(
            c.load_slot(tokens(&[1]), true),
            Err(CacheError::NoSlots)
        ));
    }

    #[test]
    fn full_prefix_match_leaves_one_input_to_decode() {
        let mut c = cache(16, 1, false);
        c.slot_mut(0).inputs = tokens(&[5, 6, 7]);

        let (id, rest) = c.load_slot(tokens(&[5, 6, 7]), true).unwrap();
        assert_eq!(id, 0);
        assert_eq!(rest, tokens(&[7]));
        assert_eq!(c.slot(0).inputs, tokens(&[5, 6]));
    }

    #[test]
    fn cache_prompt_false_discards_prefix() {
        let mut c = cache(16, 1, false);
        c.slot_mut(0).inputs = tokens(&[5, 6, 7]);

        let (_, rest) = c.load_slot(tokens(&[5, 6, 7, 8]), false).unwrap();
        assert_eq!(rest, tokens(&[5, 6, 7, 8]));
        assert!(c.slot(0).inputs.is_empty());
    }

    #[test]
    fn partial_erase_fallback_resets_num_past() {
        let backend = Arc::new(MockBackend::new().without_partial_erase());
        let mut c = InputCache::new(backend, 16, 1, false).unwrap();
        c.slot_mut(0).inputs = tokens(&[1, 2, 3]);

        let (_, rest) = c.load_slot(tokens(&[1, 2, 3, 4]), true).unwrap();
        // The backend refused the partial erase, so nothing is reused.
        assert_eq!(rest, tokens(&[1, 2, 3, 4]));
        assert!(c.slot(0).inputs.is_empty());
    }

    #[test]
    fn multi_user_reuses_exact_free_slot() {
        let mut c = cache(16, 2, true);
        c.slot_mut(0).inputs = tokens(&[1, 2, 3]);

        let (id, rest) = c.load_slot(tokens(&[1, 2, 3, 4]), true).unwrap();
        assert_eq!(id, 0);
        assert_eq!(rest, tokens(&[4]));
    }

    #[test]
    fn multi_user_forks_busy_donor_into_lru_slot() {
        let backend = Arc::new(MockBackend::new());
        let mut c = InputCache::new(backend.clone(), 16, 2, true).unwrap();
        c.slot_mut(0).inputs = tokens(&[1, 2, 3, 4]);
        c.slot_mut(0).in_use = true;

        let (id, rest) = c.load_slot(tokens(&[1, 2, 3, 9]), true).unwrap();
        assert_eq!(id, 1);
        assert_eq!(rest, tokens(&[9]));
        assert_eq!(c.slot(1).inputs, tokens(&[1, 2, 3]));
        assert!(backend.kv_copies().contains(&(0, 1, 0, 3)));
    }

    #[test]
    fn multi_user_fails_when_every_slot_busy() {
        let mut c = cache(16, 2, true);
        c.slot_mut(0).in_use = true;
        c.slot_mut(1).in_use = true;
        assert!(matches!(
            c.load_slot(tokens(&[1]), true),
            Err(CacheError::NoSlots)
        ));
    }

    #[test]
    fn multi_user_evicts_least_recently_used() {
        let mut c = cache(16, 2, true);
        c.slot_mut(0).inputs = tokens(&[7, 8]);
        c.slot_mut(0).last_used = Some(Instant::now());
        c.slot_mut(1).inputs = tokens(&[9]);
        c.slot_mut(1).last_used = None; // never used → oldest

        // No prefix in common with either slot: the LRU slot is recycled.
        let (id, _) = c.load_slot(tokens(&[50, 51]), true).unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn shift_discards_half_the_shiftable_window() {
        let backend = Arc::new(MockBackend::new());
        let mut c = InputCache::new(backend.clone(), 6, 1, false).unwrap();
        c.slot_mut(0).inputs = tokens(&[10, 11, 12, 13, 14, 15]);

        c.shift_slot(0, 2).unwrap();

        // target_free = max((6-2)/2, 1) = 2, current_free = 0 → discard 2.
        assert_eq!(c.slot(0).inputs, tokens(&[10, 11, 14, 15]));
        assert!(backend.kv_removals().contains(&(0, 2, 4)));
        assert!(backend.kv_shifts().contains(&(0, 4, 6, -2)));
    }

    #[test]
    fn shift_is_noop_below_threshold() {
        let backend = Arc::new(MockBackend::new());
        let mut c = InputCache::new(backend.clone(), 8, 1, false).unwrap();
        c.slot_mut(0).inputs = tokens(&[1, 2, 3]);

        c.shift_slot(0, 2).unwrap();
        assert_eq!(c.slot(0).inputs, tokens(&[1, 2, 3]));
        assert!(backend.kv_shifts().is_empty());
    }

    #[test]
    fn shift_rejects_keep_exceeding_context() {
        let mut c = cache(4, 1, false);
        assert!(matches!(
            c.shift_slot(0, 4),
            Err(CacheError::KeepExceedsContext { .. })
        ));
    }

    #[test]
    fn shift_surfaces_backend_refusal() {
        let backend = Arc::new(MockBackend::new().without_partial_erase());
        let mut c = InputCache::new(backend, 4, 1, false).unwrap();
        c.slot_mut(0).inputs = tokens(&[1, 2, 3, 4]);

        assert!(matches!(
            c.shift_slot(0, 1),
            Err(CacheError::ShiftRemoveFailed { .. })
        ));
    }
}
