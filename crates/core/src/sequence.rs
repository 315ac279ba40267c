//! Per-request decoding state.
//!
//! A sequence is built from a prompt (with optional `[img-N]` image
//! markers), trimmed to the slot context window, and seeded into a fresh
//! sampling context. The scheduler consumes the sequence until a terminal
//! condition and streams output through the channels handed back to the
//! request handler as a [`SequenceHandle`].

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::backend::{BackendError, Input, ModelBackend, SamplingContext, SamplingParams};
use crate::image::{ImageContext, ImageError};

/// Channel capacity for streamed pieces. When the consumer stalls, the
/// scheduler's flush blocks, throttling generation to the slowest client.
const RESPONSE_CHANNEL_SIZE: usize = 100;

static IMAGE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[img-(\d+)\]").unwrap());

#[derive(Error, Debug)]
pub enum SequenceError {
    #[error("no input provided")]
    EmptyPrompt,

    #[error("invalid image index: {0}")]
    InvalidImageIndex(i32),

    #[error("failed to process inputs: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Why a sequence finished. Embedding-only sequences finish without one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoneReason {
    /// An end-of-generation token or a stop string was hit.
    Stop,
    /// The configured prediction limit was reached.
    Limit,
    /// The client went away.
    Connection,
}

impl DoneReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DoneReason::Stop => "stop",
            DoneReason::Limit => "limit",
            DoneReason::Connection => "connection",
        }
    }
}

/// Final accounting for a finished sequence, emitted as the last event on
/// the output channel. Handlers derive response timings from it.
#[derive(Clone, Debug)]
pub struct SequenceSummary {
    pub done_reason: Option<DoneReason>,
    pub num_prompt_inputs: usize,
    pub num_decoded: usize,
    pub start_processing: Instant,
    pub start_generation: Option<Instant>,
}

impl SequenceSummary {
    /// Wall time spent on prompt evaluation.
    pub fn prompt_duration(&self) -> Duration {
        match self.start_generation {
            Some(g) => g.duration_since(self.start_processing),
            None => Duration::ZERO,
        }
    }

    /// Wall time spent generating, up to now.
    pub fn predicted_duration(&self) -> Duration {
        match self.start_generation {
            Some(g) => g.elapsed(),
            None => Duration::ZERO,
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.start_processing.elapsed()
    }
}

/// One event on a sequence's output stream. Pieces arrive in generation
/// order; `Done` (or `Error`) is the final event before the channel closes.
#[derive(Clone, Debug)]
pub enum SequenceEvent {
    Piece(String),
    Error(String),
    Done(SequenceSummary),
}

/// The handler's end of a sequence: streamed events plus the single-shot
/// embedding channel used by embedding-only sequences. Dropping the handle
/// is the disconnect signal; the scheduler observes the closed channel at
/// its next flush and finalizes the sequence.
pub struct SequenceHandle {
    pub events: mpsc::Receiver<SequenceEvent>,
    pub embedding: mpsc::Receiver<Vec<f32>>,
}

/// Construction parameters for a sequence.
pub struct SequenceParams {
    pub num_predict: i32,
    pub stop: Vec<String>,
    pub num_keep: i32,
    pub sampling: Option<SamplingParams>,
    pub embedding_only: bool,
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            num_predict: -1,
            stop: Vec::new(),
            num_keep: 0,
            sampling: None,
            embedding_only: false,
        }
    }
}

/// An image attached to a request, referenced from the prompt by id.
#[derive(Clone, Debug)]
pub struct ImageData {
    pub data: Vec<u8>,
    pub id: i32,
    pub aspect_ratio_id: i32,
}

pub struct Sequence {
    /// Unsubmitted inputs: the prompt suffix, later the just-sampled token.
    pub(crate) inputs: Vec<Input>,
    /// Inputs staged in the current batch but not yet committed to the slot.
    pub(crate) pending_inputs: Vec<Input>,
    /// Sampled pieces held back pending stop-suffix or UTF-8 completion.
    pub(crate) pending_pieces: Vec<Vec<u8>>,
    /// KV slot id, assigned at publication.
    pub(crate) cache_slot: Option<usize>,
    pub(crate) cross_attention: bool,
    /// Index within the most recent batch, for logits readout.
    pub(crate) i_batch: usize,
    pub(crate) num_predict: i32,
    pub(crate) num_predicted: i32,
    pub(crate) num_decoded: usize,
    pub(crate) num_prompt_inputs: usize,
    pub(crate) num_keep: usize,
    pub(crate) stop: Vec<String>,
    pub(crate) sampling: Box<dyn SamplingContext>,
    pub(crate) embedding_only: bool,
    pub(crate) events: mpsc::Sender<SequenceEvent>,
    pub(crate) embedding: mpsc::Sender<Vec<f32>>,
    pub(crate) start_processing: Instant,
    pub(crate) start_generation: Option<Instant>,
}

impl Sequence {
    /// Build a sequence from a prompt and optional images.
    ///
    /// Applies context-window trimming, normalizes `num_keep` and seeds the
    /// sampling context with the prompt token history.
    pub fn new(
        backend: &dyn ModelBackend,
        image: Option<&ImageContext>,
        num_ctx: usize,
        prompt: &str,
        images: &[ImageData],
        params: SequenceParams,
    ) -> Result<(Self, SequenceHandle), SequenceError> {
        let start_processing = Instant::now();

        let mut inputs = prompt_inputs(backend, image, prompt, images)?;
        if inputs.is_empty() {
            return Err(SequenceError::EmptyPrompt);
        }

        let mut num_keep = params.num_keep;
        if num_keep < 0 {
            num_keep = inputs.len() as i32;
        }
        if backend.add_bos_token() {
            num_keep += 1;
        }
        let num_keep = (num_keep as usize).min(num_ctx - 1);

        if inputs.len() > num_ctx {
            let discard = inputs.len() - num_ctx;
            let mut trimmed = inputs[..num_keep].to_vec();
            trimmed.extend_from_slice(&inputs[num_keep + discard..]);
            tracing::warn!(
                limit = num_ctx,
                prompt = inputs.len(),
                keep = num_keep,
                new = trimmed.len(),
                "truncating input prompt"
            );
            inputs = trimmed;
        }

        let sampling_params = params.sampling.unwrap_or_default();
        let mut sampling = backend.new_sampling_context(&sampling_params)?;
        for input in &inputs {
            if let Input::Token(t) = input {
                sampling.accept(*t, false);
            }
        }

        let (events_tx, events_rx) = mpsc::channel(RESPONSE_CHANNEL_SIZE);
        let (embedding_tx, embedding_rx) = mpsc::channel(1);

        let num_prompt_inputs = inputs.len();
        let seq = Self {
            inputs,
            pending_inputs: Vec::new(),
            pending_pieces: Vec::new(),
            cache_slot: None,
            cross_attention: false,
            i_batch: 0,
            num_predict: params.num_predict,
            num_predicted: 0,
            num_decoded: 0,
            num_prompt_inputs,
            num_keep,
            stop: params.stop,
            sampling,
            embedding_only: params.embedding_only,
            events: events_tx,
            embedding: embedding_tx,
            start_processing,
            start_generation: None,
        };
        let handle = SequenceHandle {
            events: events_rx,
            embedding: embedding_rx,
        };

        Ok((seq, handle))
    }

    pub(crate) fn summary(&self, done_reason: Option<DoneReason>) -> SequenceSummary {
        SequenceSummary {
            done_reason,
            num_prompt_inputs: self.num_prompt_inputs,
            num_decoded: self.num_decoded,
            start_processing: self.start_processing,
            start_generation: self.start_generation,
        }
    }
}

/// Tokenize `prompt`, splicing in image embeddings at `[img-N]` markers.
///
/// Markers are only recognized when an image context is configured;
/// otherwise the whole prompt is one text part. The first part is tokenized
/// with BOS, and special tokens are parsed in every part.
fn prompt_inputs(
    backend: &dyn ModelBackend,
    image: Option<&ImageContext>,
    prompt: &str,
    images: &[ImageData],
) -> Result<Vec<Input>, SequenceError> {
    let mut parts: Vec<&str> = Vec::new();
    let mut markers: Vec<i32> = Vec::new();

    if image.is_some() {
        let mut last = 0;
        for caps in IMAGE_MARKER.captures_iter(prompt) {
            let m = caps.get(0).unwrap();
            parts.push(&prompt[last..m.start()]);
            markers.push(caps[1].parse().unwrap_or(-1));
            last = m.end();
        }
        parts.push(&prompt[last..]);
    } else {
        parts.push(prompt);
    }

    let mut inputs = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        let tokens = backend.tokenize(part, i == 0, true)?;
        inputs.extend(tokens.into_iter().map(Input::Token));

        if let Some(&n) = markers.get(i) {
            let img = images
                .iter()
                .find(|img| img.id == n)
                .ok_or(SequenceError::InvalidImageIndex(n))?;

            let ctx = image.expect("image markers parsed without an image context");
            let embed = ctx.new_embed(&img.data, img.aspect_ratio_id)?;
            inputs.extend(embed.into_iter().map(Input::Embed));
        }
    }

    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBackend, MockEmbedder};
    use std::sync::Arc;

    fn backend() -> MockBackend {
        MockBackend::new()
    }

    fn image_context() -> ImageContext {
        ImageContext::new(Arc::new(MockEmbedder::new(2, 3)))
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let b = backend();
        let err = Sequence::new(&b, None, 8, "", &[], SequenceParams::default());
        assert!(matches!(err, Err(SequenceError::EmptyPrompt)));
    }

    #[test]
    fn plain_prompt_tokenizes_to_token_inputs() {
        let b = backend();
        let (seq, _handle) =
            Sequence::new(&b, None, 16, "abc", &[], SequenceParams::default()).unwrap();
        assert_eq!(
            seq.inputs,
            vec![
                Input::Token('a' as i32),
                Input::Token('b' as i32),
                Input::Token('c' as i32)
            ]
        );
        assert_eq!(seq.num_prompt_inputs, 3);
    }

    #[test]
    fn markers_are_plain_text_without_an_image_context() {
        let b = backend();
        let (seq, _handle) =
            Sequence::new(&b, None, 64, "a[img-0]b", &[], SequenceParams::default()).unwrap();
        assert_eq!(seq.inputs.len(), "a[img-0]b".chars().count());
        assert!(seq.inputs.iter().all(|i| !i.is_embed()));
    }

    #[test]
    fn image_marker_splices_embeddings() {
        let b = backend();
        let ctx = image_context();
        let images = vec![ImageData {
            data: vec![9],
            id: 7,
            aspect_ratio_id: 0,
        }];
        let (seq, _handle) = Sequence::new(
            &b,
            Some(&ctx),
            64,
            "ab[img-7]cd",
            &images,
            SequenceParams::default(),
        )
        .unwrap();

        // 2 text tokens, 2 embedding vectors, 2 text tokens.
        assert_eq!(seq.inputs.len(), 6);
        assert!(seq.inputs[2].is_embed());
        assert!(seq.inputs[3].is_embed());
        assert!(!seq.inputs[4].is_embed());
    }

    #[test]
    fn unknown_image_id_is_an_error() {
        let b = backend();
        let ctx = image_context();
        let err = Sequence::new(
            &b,
            Some(&ctx),
            64,
            "x[img-3]",
            &[],
            SequenceParams::default(),
        );
        assert!(matches!(err, Err(SequenceError::InvalidImageIndex(3))));
    }

    #[test]
    fn long_prompt_keeps_head_and_tail() {
        let b = backend();
        let (seq, _handle) = Sequence::new(
            &b,
            None,
            4,
            "abcdefgh",
            &[],
            SequenceParams {
                num_keep: 2,
                ..SequenceParams::default()
            },
        )
        .unwrap();

        // 8 inputs into a window of 4: keep [a, b], drop 4, keep [g, h].
        assert_eq!(
            seq.inputs,
            vec![
                Input::Token('a' as i32),
                Input::Token('b' as i32),
                Input::Token('g' as i32),
                Input::Token('h' as i32)
            ]
        );
    }

    #[test]
    fn negative_num_keep_clamps_to_window() {
        let b = backend();
        let (seq, _handle) = Sequence::new(
            &b,
            None,
            4,
            "abcdefgh",
            &[],
            SequenceParams {
                num_keep: -1,
                ..SequenceParams::default()
            },
        )
        .unwrap();
        // num_keep becomes len(inputs), clamped to num_ctx - 1 = 3; one
        // tail input survives the trim.
        assert_eq!(seq.num_keep, 3);
        assert_eq!(seq.inputs.len(), 4);
        assert_eq!(seq.inputs[3], Input::Token('h' as i32));
    }

    #[test]
    fn bos_model_grows_num_keep() {
        let b = MockBackend::new().with_add_bos();
        let (seq, _handle) = Sequence::new(
            &b,
            None,
            16,
            "abc",
            &[],
            SequenceParams {
                num_keep: 2,
                ..SequenceParams::default()
            },
        )
        .unwrap();
        assert_eq!(seq.num_keep, 3);
    }

    #[test]
    fn sampler_is_seeded_with_prompt_tokens_only() {
        let b = backend();
        let ctx = image_context();
        let images = vec![ImageData {
            data: vec![1],
            id: 0,
            aspect_ratio_id: 0,
        }];
        let (_seq, _handle) = Sequence::new(
            &b,
            Some(&ctx),
            64,
            "ab[img-0]",
            &images,
            SequenceParams::default(),
        )
        .unwrap();

        let accepted = b.accepted();
        assert_eq!(accepted.len(), 2);
        assert!(accepted.iter().all(|&(_, grammar)| !grammar));
    }
}
