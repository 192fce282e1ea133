//! Server-sent event decoding for streamed chat completions.

use crate::{sanitize_error_message, DeltaStream, ErrorDetail};
use futures::stream::{self, BoxStream, Stream};
use futures::StreamExt;
use serde::Deserialize;
use std::collections::VecDeque;

/// One decoded event payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A `data:` payload
    Data(String),
    /// The `[DONE]` terminator
    Done,
}

/// Incremental SSE line decoder.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed raw bytes, returning every frame completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            self.accept_line(line, &mut frames);
        }

        frames
    }

    /// Flush whatever is left once the body ends
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).trim_end().to_string();
            self.accept_line(&line, &mut frames);
        }
        self.dispatch(&mut frames);
        frames
    }

    fn accept_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            self.dispatch(frames);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // event:, id: and retry: carry nothing we use
    }

    fn dispatch(&mut self, frames: &mut Vec<SseFrame>) {
        if self.data.is_empty() {
            return;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        if payload.trim() == "[DONE]" {
            frames.push(SseFrame::Done);
        } else {
            frames.push(SseFrame::Data(payload));
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Text carried by one chunk payload, if any
pub fn parse_delta(payload: &str) -> anyhow::Result<Option<String>> {
    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| anyhow::anyhow!("Malformed stream chunk: {}", e))?;

    if let Some(error) = chunk.error {
        anyhow::bail!(
            "API error: {} ({})",
            sanitize_error_message(&error.message),
            error.error_type
        );
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|text| !text.is_empty()))
}

struct DeltaState {
    body: BoxStream<'static, anyhow::Result<Vec<u8>>>,
    decoder: SseDecoder,
    pending: VecDeque<anyhow::Result<String>>,
    finished: bool,
}

impl DeltaState {
    fn absorb(&mut self, frames: Vec<SseFrame>) {
        for frame in frames {
            if self.finished {
                return;
            }
            match frame {
                SseFrame::Done => self.finished = true,
                SseFrame::Data(payload) => match parse_delta(&payload) {
                    Ok(Some(text)) => self.pending.push_back(Ok(text)),
                    Ok(None) => {}
                    Err(e) => {
                        self.pending.push_back(Err(e));
                        self.finished = true;
                    }
                },
            }
        }
    }
}

/// Turn a raw SSE body into a stream of content deltas.
///
/// The stream ends at `[DONE]`, at the end of the body, or after the first error.
pub fn delta_stream<S, E>(body: S) -> DeltaStream
where
    S: Stream<Item = Result<Vec<u8>, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = DeltaState {
        body: body.map(|chunk| chunk.map_err(anyhow::Error::new)).boxed(),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let frames = state.decoder.push(&bytes);
                    state.absorb(frames);
                }
                Some(Err(e)) => {
                    state.pending.push_back(Err(e.context("Response stream interrupted")));
                    state.finished = true;
                }
                None => {
                    let frames = state.decoder.finish();
                    state.absorb(frames);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}
