//! Minimal `text/event-stream` decoding for the delegated build service.
//!
//! Only `data:` fields matter; `event:`, `id:` and comment lines are skipped.
//! Multi-line data is joined with `\n` as the format prescribes.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use tracing::warn;

use super::BuildEventStream;
use crate::error::CoreError;
use crate::types::BuildEvent;

/// Incremental line splitter that yields the data payload of each event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed raw bytes; returns every event payload completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(payload) = self.line(line) {
                out.push(payload);
            }
        }
        out
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let rest = String::from_utf8_lossy(&rest).into_owned();
            if let Some(payload) = self.line(rest.trim_end_matches('\r')) {
                return Some(payload);
            }
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_owned());
        }
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.data).join("\n"))
    }
}

struct DecodeState {
    body: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    done: bool,
}

/// Turn an SSE response body into build events. Payloads that are not valid
/// event JSON are logged and skipped; a transport error ends the stream.
pub fn decode_events<S>(body: S) -> BuildEventStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = DecodeState {
        body: body.boxed(),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            while let Some(payload) = st.pending.pop_front() {
                match BuildEvent::from_json(&payload) {
                    Ok(event) => return Some((Ok(event), st)),
                    Err(e) => warn!(error = %e, "skipping undecodable build event"),
                }
            }
            if st.done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    let payloads = st.decoder.push(&chunk);
                    st.pending.extend(payloads);
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(CoreError::from(e)), st));
                }
                None => {
                    st.done = true;
                    st.pending.extend(st.decoder.finish());
                }
            }
        }
    })
    .boxed()
}
