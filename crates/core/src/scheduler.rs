//! The single decode loop.
//!
//! One dedicated thread owns all backend access: it assembles ready inputs
//! from the live sequences into a shared batch (token or image-embedding,
//! never mixed), decodes, samples, enforces stop sequences and UTF-8
//! boundaries, and streams pieces to the handlers. Handlers interact only
//! through the admission semaphore, the state mutex during publication, and
//! the per-sequence channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use crate::backend::{BackendError, DecodeBatch, DecodeError, Input, ModelBackend};
use crate::cache::{CacheError, InputCache};
use crate::image::ImageContext;
use crate::sequence::{
    DoneReason, ImageData, Sequence, SequenceError, SequenceEvent, SequenceHandle, SequenceParams,
};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// All sequence slots are occupied. The admission semaphore makes this
    /// unreachable in practice; it is surfaced instead of being trusted.
    #[error("could not find an available sequence slot")]
    NoSequenceSlot,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BatchKind {
    Token,
    Embed,
}

struct SchedulerState {
    seqs: Vec<Option<Sequence>>,
    next_seq: usize,
    cache: InputCache,
}

/// The shared scheduler. `run` is executed on a dedicated thread; every
/// other method is handler-facing.
pub struct Scheduler {
    backend: Arc<dyn ModelBackend>,
    image: Option<Arc<ImageContext>>,
    batch_size: usize,
    parallel: usize,
    num_ctx: usize,
    state: Mutex<SchedulerState>,
    work: Condvar,
    semaphore: Arc<Semaphore>,
    stopping: AtomicBool,
}

impl Scheduler {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        image: Option<Arc<ImageContext>>,
        kv_size: usize,
        batch_size: usize,
        parallel: usize,
        multi_user_cache: bool,
    ) -> Result<Self, CacheError> {
        let cache = InputCache::new(backend.clone(), kv_size, parallel, multi_user_cache)?;
        let num_ctx = cache.num_ctx();

        Ok(Self {
            backend,
            image,
            batch_size,
            parallel,
            num_ctx,
            state: Mutex::new(SchedulerState {
                seqs: (0..parallel).map(|_| None).collect(),
                next_seq: 0,
                cache,
            }),
            work: Condvar::new(),
            semaphore: Arc::new(Semaphore::new(parallel)),
            stopping: AtomicBool::new(false),
        })
    }

    /// Context window available to each sequence.
    pub fn num_ctx(&self) -> usize {
        self.num_ctx
    }

    /// Build a sequence against this scheduler's backend and window.
    pub fn new_sequence(
        &self,
        prompt: &str,
        images: &[ImageData],
        params: SequenceParams,
    ) -> Result<(Sequence, SequenceHandle), SequenceError> {
        Sequence::new(
            self.backend.as_ref(),
            self.image.as_deref(),
            self.num_ctx,
            prompt,
            images,
            params,
        )
    }

    /// Reserve one of the `parallel` sequence slots. Cancelling the future
    /// (client disconnect) releases the reservation.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.semaphore.clone().acquire_owned().await
    }

    /// Publish a sequence into a free slot: assign a KV cache slot by
    /// prefix match, compute cross-attention for the reused prefix, and
    /// wake the decode loop. The permit is consumed on success and released
    /// on failure.
    pub fn publish(
        &self,
        mut seq: Sequence,
        cache_prompt: bool,
        permit: OwnedSemaphorePermit,
    ) -> Result<(), PublishError> {
        let mut st = self.state.lock().unwrap();

        let Some(idx) = st.seqs.iter().position(Option::is_none) else {
            return Err(PublishError::NoSequenceSlot);
        };

        let prompt = std::mem::take(&mut seq.inputs);
        let (slot_id, remaining) = st.cache.load_slot(prompt, cache_prompt)?;
        seq.inputs = remaining;
        seq.cache_slot = Some(slot_id);
        seq.cross_attention = match &self.image {
            Some(img) => img.need_cross_attention(&st.cache.slot(slot_id).inputs),
            None => false,
        };

        st.seqs[idx] = Some(seq);
        drop(st);

        permit.forget();
        self.work.notify_one();
        Ok(())
    }

    /// Ask the decode loop to exit after its current iteration.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.work.notify_all();
    }

    /// The decode loop. Blocks until [`Scheduler::stop`]; run it on a
    /// dedicated thread.
    pub fn run(&self) -> Result<(), BackendError> {
        let mut token_batch = self.backend.new_batch(self.batch_size, self.parallel, 0)?;

        let embed_batch_size = self
            .image
            .as_deref()
            .map(|img| img.batch_size(self.batch_size))
            .unwrap_or(0);
        let mut embed_batch: Box<dyn DecodeBatch> = if embed_batch_size != 0 {
            let embed_size = self.image.as_deref().map(ImageContext::embed_size).unwrap_or(0);
            self.backend
                .new_batch(embed_batch_size, self.parallel, embed_size)?
        } else {
            Box::new(PlaceholderBatch)
        };

        loop {
            {
                let mut st = self.state.lock().unwrap();
                while st.seqs.iter().all(Option::is_none)
                    && !self.stopping.load(Ordering::SeqCst)
                {
                    st = self.work.wait(st).unwrap();
                }
                if self.stopping.load(Ordering::SeqCst) {
                    return Ok(());
                }
                self.process_batch(&mut st, token_batch.as_mut(), embed_batch.as_mut());
            }

            token_batch.clear();
            embed_batch.clear();
        }
    }

    /// One scheduler tick: assemble, decode, post-process.
    fn process_batch(
        &self,
        st: &mut SchedulerState,
        token_batch: &mut dyn DecodeBatch,
        embed_batch: &mut dyn DecodeBatch,
    ) {
        let SchedulerState {
            seqs,
            next_seq,
            cache,
        } = st;

        let mut current: Option<BatchKind> = None;
        let mut cross_attention = false;
        // Sequence indices with inputs staged in this tick's batch.
        let mut contributed: Vec<usize> = Vec::new();

        let n = seqs.len();
        let start = *next_seq;
        for k in 0..n {
            let idx = (start + k) % n;
            let Some(mut seq) = seqs[idx].take() else {
                continue;
            };

            if seq.num_predict > 0 && seq.num_predicted >= seq.num_predict {
                self.finalize(cache, seq, Some(DoneReason::Limit));
                continue;
            }

            let Some(slot_id) = seq.cache_slot else {
                self.fail(cache, seq, "sequence was published without a cache slot".into());
                continue;
            };

            let total = seq.inputs.len();
            let mut added = 0;
            let mut shift_err: Option<CacheError> = None;

            for i in 0..total {
                let staged = seq.pending_inputs.len() + added;
                if cache.slot(slot_id).inputs.len() + staged + 1 > self.num_ctx {
                    if staged == 0 {
                        if let Err(e) = cache.shift_slot(slot_id, seq.num_keep) {
                            shift_err = Some(e);
                            break;
                        }
                    } else {
                        // Let the staged inputs drain first; the shift is
                        // retried on the next tick.
                        break;
                    }
                }

                let embedding = seq.inputs[i].is_embed();

                // The first input of the tick picks the batch kind. A later
                // input needing the other kind (or a different
                // cross-attention state) ends this sequence's turn, and the
                // next tick resumes from it.
                let kind = match current {
                    None => {
                        let kind = if embedding {
                            seq.cross_attention = self
                                .image
                                .as_deref()
                                .map(|img| {
                                    img.need_cross_attention(std::slice::from_ref(&seq.inputs[i]))
                                })
                                .unwrap_or(false);
                            BatchKind::Embed
                        } else {
                            BatchKind::Token
                        };
                        current = Some(kind);
                        kind
                    }
                    Some(kind) => {
                        if embedding != (kind == BatchKind::Embed)
                            || cross_attention != seq.cross_attention
                        {
                            *next_seq = idx;
                            break;
                        }
                        kind
                    }
                };

                let batch: &mut dyn DecodeBatch = match kind {
                    BatchKind::Token => &mut *token_batch,
                    BatchKind::Embed => &mut *embed_batch,
                };

                if i >= batch.size() {
                    break;
                }

                cross_attention = seq.cross_attention;
                let pos = cache.slot(slot_id).inputs.len() + seq.pending_inputs.len() + added;
                batch.add(&seq.inputs[i], pos, i + 1 == total, slot_id);
                added += 1;
                seq.i_batch = batch.num_tokens() - 1;
            }

            if let Some(e) = shift_err {
                tracing::error!(error = %e, "failed to shift cache slot");
                self.fail(cache, seq, format!("failed to shift context: {e}"));
                continue;
            }

            let staged: Vec<Input> = seq.inputs.drain(..added).collect();
            seq.pending_inputs.extend(staged);
            if added > 0 {
                contributed.push(idx);
            }
            seqs[idx] = Some(seq);
        }

        let Some(kind) = current else {
            return;
        };
        let batch: &mut dyn DecodeBatch = match kind {
            BatchKind::Token => token_batch,
            BatchKind::Embed => embed_batch,
        };
        if batch.num_tokens() == 0 {
            return;
        }

        self.backend.set_cross_attention(cross_attention);

        let mut result = self.backend.decode(batch);
        if matches!(result, Err(DecodeError::KvCacheFull)) {
            tracing::debug!("defragmenting kv cache");
            self.backend.kv_cache_defrag();
            result = self.backend.decode(batch);
        }
        if let Err(e) = result {
            tracing::error!(error = %e, "failed to decode batch");
            for idx in contributed {
                if let Some(seq) = seqs[idx].take() {
                    self.fail(cache, seq, format!("failed to decode batch: {e}"));
                }
            }
            return;
        }

        if cross_attention {
            // Cross-attention state may still be in flight on multi-GPU
            // systems; decoding the next batch before it settles can
            // invalidate it.
            self.backend.synchronize();
        }

        for idx in 0..seqs.len() {
            let Some(mut seq) = seqs[idx].take() else {
                continue;
            };
            let Some(slot_id) = seq.cache_slot else {
                seqs[idx] = Some(seq);
                continue;
            };

            // After a successful decode the staged inputs are resident in
            // the slot's KV partition.
            if !seq.pending_inputs.is_empty() {
                cache.slot_mut(slot_id).inputs.append(&mut seq.pending_inputs);
            }

            // Still prompt processing: nothing to sample yet.
            if !seq.inputs.is_empty() {
                seqs[idx] = Some(seq);
                continue;
            }

            seq.num_decoded += 1;
            if seq.num_decoded == 1 {
                seq.start_generation = Some(Instant::now());
            }

            if seq.embedding_only {
                let embed = self
                    .backend
                    .embeddings_seq(slot_id)
                    .or_else(|| self.backend.embeddings_ith(seq.i_batch))
                    .unwrap_or_default();
                let _ = seq.embedding.blocking_send(embed);
                self.finalize(cache, seq, None);
                continue;
            }

            let token = seq.sampling.sample(seq.i_batch);
            seq.sampling.accept(token, true);
            let piece = self.backend.token_to_piece(token);
            seq.num_predicted += 1;

            if self.backend.token_is_eog(token) {
                self.finalize(cache, seq, Some(DoneReason::Stop));
                continue;
            }

            // The sampled token is the next tick's input.
            seq.inputs = vec![Input::Token(token)];

            seq.pending_pieces.push(piece);
            let joined = seq.pending_pieces.concat();

            if let Some(stop) = find_stop(&joined, &seq.stop) {
                let stop = stop.to_owned();
                tracing::debug!(stop = %stop, "hit stop sequence");

                let orig_len = seq.pending_pieces.len();
                let (kept, token_truncated) = truncate_stop(&seq.pending_pieces, stop.as_bytes());
                let new_len = kept.len();
                seq.pending_pieces = kept;

                // Reconcile the slot with the pieces that will actually be
                // returned: the just-sampled token was never decoded, the
                // stripped stop pieces are gone, and a partially-kept piece
                // (or a stop that stripped nothing) drops one more.
                let mut token_len = cache.slot(slot_id).inputs.len() + 1;
                token_len = token_len.saturating_sub(orig_len - new_len);
                if token_truncated || orig_len == new_len {
                    token_len = token_len.saturating_sub(1);
                }
                cache.slot_mut(slot_id).inputs.truncate(token_len);

                self.finalize(cache, seq, Some(DoneReason::Stop));
                continue;
            }

            if contains_stop_suffix(&joined, &seq.stop) {
                seqs[idx] = Some(seq);
                continue;
            }

            if incomplete_utf8(&joined) {
                seqs[idx] = Some(seq);
                continue;
            }

            if flush_pending(&mut seq) {
                seqs[idx] = Some(seq);
            } else {
                self.finalize(cache, seq, Some(DoneReason::Connection));
            }
        }
    }

    /// Finalize a sequence: flush held pieces, emit the summary, release
    /// the KV slot and the admission permit.
    fn finalize(&self, cache: &mut InputCache, mut seq: Sequence, reason: Option<DoneReason>) {
        flush_pending(&mut seq);
        let summary = seq.summary(reason);
        let _ = seq.events.blocking_send(SequenceEvent::Done(summary));
        if let Some(slot) = seq.cache_slot {
            cache.release(slot);
        }
        self.semaphore.add_permits(1);
    }

    /// Abandon a sequence with an error, releasing its slot and permit.
    fn fail(&self, cache: &mut InputCache, seq: Sequence, message: String) {
        let _ = seq.events.blocking_send(SequenceEvent::Error(message));
        if let Some(slot) = seq.cache_slot {
            cache.release(slot);
        }
        self.semaphore.add_permits(1);
    }
}

/// Zero-capacity stand-in for the embedding batch when no vision model is
/// configured.
struct PlaceholderBatch;

impl DecodeBatch for PlaceholderBatch {
    fn add(&mut self, _input: &Input, _pos: usize, _is_last: bool, _seq_id: usize) {}

    fn num_tokens(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        0
    }

    fn is_embedding(&self) -> bool {
        true
    }

    fn clear(&mut self) {}

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Send the held pieces as one string, trimming trailing bytes until the
/// buffer is valid UTF-8. Returns `false` when the receiver is gone.
fn flush_pending(seq: &mut Sequence) -> bool {
    let mut joined = seq.pending_pieces.concat();
    seq.pending_pieces.clear();

    // The incomplete-code-point hold catches most of this during
    // generation, but a terminating sequence can still carry a partial
    // code point, and invalid bytes can appear mid-buffer.
    if let Err(e) = std::str::from_utf8(&joined) {
        joined.truncate(e.valid_up_to());
    }
    if joined.is_empty() {
        return true;
    }
    let text = match String::from_utf8(joined) {
        Ok(t) => t,
        Err(_) => return true,
    };

    seq.events.blocking_send(SequenceEvent::Piece(text)).is_ok()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// First configured stop string occurring anywhere in `sequence`.
fn find_stop<'a>(sequence: &[u8], stops: &'a [String]) -> Option<&'a str> {
    stops
        .iter()
        .find(|stop| find_subslice(sequence, stop.as_bytes()).is_some())
        .map(String::as_str)
}

/// Whether `sequence` ends with a non-empty prefix of any stop string,
/// meaning flushing must wait for more pieces.
fn contains_stop_suffix(sequence: &[u8], stops: &[String]) -> bool {
    stops.iter().any(|stop| {
        let stop = stop.as_bytes();
        (1..=stop.len()).any(|i| sequence.ends_with(&stop[..i]))
    })
}

/// Cut the piece list so the joined bytes end exactly before the first
/// occurrence of `stop`. The second value reports whether the cut landed
/// inside a piece.
fn truncate_stop(pieces: &[Vec<u8>], stop: &[u8]) -> (Vec<Vec<u8>>, bool) {
    let joined = pieces.concat();
    let Some(index) = find_subslice(&joined, stop) else {
        return (pieces.to_vec(), false);
    };
    let joined = &joined[..index];

    let mut result = Vec::new();
    let mut token_truncated = false;
    let mut start = 0;
    for piece in pieces {
        if start >= joined.len() {
            break;
        }
        let mut end = start + piece.len();
        if end > joined.len() {
            end = joined.len();
            token_truncated = true;
        }
        result.push(joined[start..end].to_vec());
        start = end;
    }

    (result, token_truncated)
}

/// Whether the trailing bytes form an incomplete UTF-8 code point: the
/// last lead byte announces more continuation bytes than are present.
fn incomplete_utf8(bytes: &[u8]) -> bool {
    for i in 1..=bytes.len().min(4) {
        let c = bytes[bytes.len() - i];

        if c & 0xc0 == 0x80 {
            // Continuation byte: 10xxxxxx.
            continue;
        }

        if c & 0xe0 == 0xc0 {
            // 2-byte lead: 110xxxxx.
            return i < 2;
        } else if c & 0xf0 == 0xe0 {
            // 3-byte lead: 1110xxxx.
            return i < 3;
        } else if c & 0xf8 == 0xf0 {
            // 4-byte lead: 11110xxx.
            return i < 4;
        }

        // 1-byte character or invalid byte.
        return false;
    }

    false
}
