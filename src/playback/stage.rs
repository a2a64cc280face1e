//! Composable body stream stages
//!
//! Every stage takes a [`BodyStream`] and returns a new one, so a
//! [`Pipeline`] is just a fold over its stages. Dropping the outer stream
//! drops every stage below it, including any pending throttle sleep.

use std::io::{self, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use futures_util::stream::{self, Stream, StreamExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use tokio::time::Instant;

/// Chunk size used by the throttle stage
pub const THROTTLE_CHUNK_SIZE: usize = 512;

/// Stream of body chunks flowing through the stages
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Response body type used by every response the proxy produces
pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

/// Wrap a stream as a response body
#[must_use]
pub fn into_body(stream: BodyStream) -> ProxyBody {
    StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync()
}

/// Stream yielding a single chunk
#[must_use]
pub fn once(data: Bytes) -> BodyStream {
    Box::pin(stream::once(async move { Ok(data) }))
}

/// Concatenate a stream into one buffer
///
/// # Errors
///
/// Returns the first error produced by the stream
pub async fn collect(mut input: BodyStream) -> io::Result<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = input.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

/// One transformation of a body stream
#[derive(Debug, Clone)]
pub enum Stage {
    /// Gzip-compress the stream
    Gzip,
    /// Decompress a gzip stream
    Gunzip,
    /// Count bytes passing through into the shared counter
    Measure(Arc<AtomicU64>),
    /// Limit the stream to the given bytes per second
    Throttle(f64),
}

impl Stage {
    /// Apply this stage on top of `input`
    #[must_use]
    pub fn apply(self, input: BodyStream) -> BodyStream {
        match self {
            Self::Gzip => transcode(input, GzEncoder::new(Vec::new(), Compression::default())),
            Self::Gunzip => transcode(input, GzDecoder::new(Vec::new())),
            Self::Measure(counter) => measure(input, counter),
            Self::Throttle(rate) => throttle(input, rate),
        }
    }
}

/// Ordered list of stages
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Empty pipeline, passes the stream through untouched
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage
    #[must_use]
    pub fn with(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Stages in application order
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Run `input` through every stage in order
    #[must_use]
    pub fn apply(self, input: BodyStream) -> BodyStream {
        self.stages
            .into_iter()
            .fold(input, |stream, stage| stage.apply(stream))
    }
}

/// Writer that accumulates its output in a `Vec` until finished
trait Transcoder: Write + Send + 'static {
    fn output(&mut self) -> &mut Vec<u8>;
    fn finish_output(self) -> io::Result<Vec<u8>>;
}

impl Transcoder for GzEncoder<Vec<u8>> {
    fn output(&mut self) -> &mut Vec<u8> {
        self.get_mut()
    }

    fn finish_output(self) -> io::Result<Vec<u8>> {
        self.finish()
    }
}

impl Transcoder for GzDecoder<Vec<u8>> {
    fn output(&mut self) -> &mut Vec<u8> {
        self.get_mut()
    }

    fn finish_output(self) -> io::Result<Vec<u8>> {
        self.finish()
    }
}

fn transcode<T: Transcoder>(input: BodyStream, coder: T) -> BodyStream {
    Box::pin(stream::unfold(
        (input, Some(coder)),
        |(mut input, mut coder)| async move {
            loop {
                let Some(active) = coder.as_mut() else {
                    return None;
                };
                match input.next().await {
                    Some(Ok(chunk)) => {
                        if let Err(e) = active.write_all(&chunk) {
                            return Some((Err(e), (input, None)));
                        }
                        let produced = std::mem::take(active.output());
                        if !produced.is_empty() {
                            return Some((Ok(Bytes::from(produced)), (input, coder)));
                        }
                    }
                    Some(Err(e)) => return Some((Err(e), (input, None))),
                    None => {
                        let finished = coder.take()?.finish_output();
                        return match finished {
                            Ok(rest) if rest.is_empty() => None,
                            Ok(rest) => Some((Ok(Bytes::from(rest)), (input, None))),
                            Err(e) => Some((Err(e), (input, None))),
                        };
                    }
                }
            }
        },
    ))
}

fn measure(input: BodyStream, counter: Arc<AtomicU64>) -> BodyStream {
    Box::pin(input.inspect_ok(move |chunk| {
        counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }))
}

struct ThrottleState {
    input: BodyStream,
    pending: Bytes,
    started: Option<Instant>,
    sent: u64,
}

fn throttle(input: BodyStream, rate: f64) -> BodyStream {
    if !rate.is_finite() || rate <= 0.0 {
        return input;
    }

    let state = ThrottleState {
        input,
        pending: Bytes::new(),
        started: None,
        sent: 0,
    };

    Box::pin(stream::unfold(state, move |mut state| async move {
        while state.pending.is_empty() {
            match state.input.next().await {
                Some(Ok(chunk)) => state.pending = chunk,
                Some(Err(e)) => return Some((Err(e), state)),
                None => return None,
            }
        }

        let started = *state.started.get_or_insert_with(Instant::now);
        let take = state.pending.len().min(THROTTLE_CHUNK_SIZE);
        let piece = state.pending.split_to(take);
        state.sent += take as u64;

        // a chunk leaves once the bucket has drained to it
        let due = Duration::try_from_secs_f64(state.sent as f64 / rate)
            .ok()
            .and_then(|delay| started.checked_add(delay));
        match due {
            Some(due) => tokio::time::sleep_until(due).await,
            None => std::future::pending::<()>().await,
        }

        Some((Ok(piece), state))
    }))
}
