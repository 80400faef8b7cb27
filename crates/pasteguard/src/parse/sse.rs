use std::io;
use std::sync::Arc;

use async_stream::try_stream;
use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::mask::PlaceholderContext;
use crate::mask::placeholder::restore_placeholders;

/// Upper bound on a single SSE line; a provider frame larger than this fails
/// the stream rather than buffering without limit.
pub const MAX_LINE_BYTES: usize = 2_097_152;

/// The two SSE dialects the proxy forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseFraming {
	/// `data: <json>\n\n`, terminated by `data: [DONE]`; text at
	/// `choices[0].delta.content`.
	OpenAi,
	/// Named events; text at `delta.text` when `delta.type == "text_delta"`.
	Anthropic,
}

/// Splits a byte stream into SSE lines.
///
/// Only complete lines are decoded to UTF-8, so multi-byte characters split
/// across network chunks never reach the text pipeline half-decoded. The
/// trailing `\r` of CRLF framing is folded away.
struct SseLineCodec {
	max_line_bytes: usize,
}

impl Decoder for SseLineCodec {
	type Item = String;
	type Error = io::Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
		let Some(pos) = src.iter().position(|b| *b == b'\n') else {
			if src.len() > self.max_line_bytes {
				return Err(io::Error::other("sse line exceeds buffer limit"));
			}
			return Ok(None);
		};
		let mut line = src.split_to(pos + 1);
		line.truncate(pos);
		if line.last() == Some(&b'\r') {
			line.truncate(line.len() - 1);
		}
		let line = std::str::from_utf8(&line)
			.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
			.to_string();
		Ok(Some(line))
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
		match self.decode(src)? {
			Some(frame) => Ok(Some(frame)),
			None if src.is_empty() => Ok(None),
			None => {
				// Final line without a terminator.
				let line = src.split();
				let line = std::str::from_utf8(&line)
					.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
					.to_string();
				Ok(Some(line))
			},
		}
	}
}

/// One holdback stage: buffers any partial placeholder so `[[` … `]]` never
/// crosses the wire half-restored, no matter how the upstream chunks fall.
pub struct StreamRestorer {
	ctx: Arc<PlaceholderContext>,
	format_value: Arc<dyn Fn(&str) -> String + Send + Sync>,
	buf: String,
}

impl StreamRestorer {
	pub fn new(
		ctx: Arc<PlaceholderContext>,
		format_value: Arc<dyn Fn(&str) -> String + Send + Sync>,
	) -> Self {
		Self {
			ctx,
			format_value,
			buf: String::new(),
		}
	}

	/// Append a fragment and return the prefix that is safe to emit,
	/// restored. The unsafe tail stays buffered for the next push.
	pub fn push(&mut self, fragment: &str) -> String {
		self.buf.push_str(fragment);
		let hold_from = holdback_index(&self.buf);
		let safe: String = self.buf.drain(..hold_from).collect();
		if safe.is_empty() {
			return safe;
		}
		restore_placeholders(&safe, &self.ctx, |v| (self.format_value)(v))
	}

	/// Stream end: restore whatever is left as best we can. A placeholder
	/// that never completed is emitted verbatim.
	pub fn flush(&mut self) -> String {
		let rest = std::mem::take(&mut self.buf);
		if rest.is_empty() {
			return rest;
		}
		restore_placeholders(&rest, &self.ctx, |v| (self.format_value)(v))
	}
}

/// Byte index from which `text` must be withheld.
///
/// Everything before the last `[[` that has no closing `]]` is safe. A
/// trailing lone `[` is withheld too: the next chunk may start with the
/// second `[` of an opener. A placeholder body never contains `[`, so a safe
/// prefix ending in `[` cannot itself be the start of one.
fn holdback_index(text: &str) -> usize {
	if let Some(pos) = text.rfind("[[") {
		if !text[pos..].contains("]]") {
			return pos;
		}
	}
	if text.ends_with('[') {
		return text.len() - 1;
	}
	text.len()
}

/// The restore stages a stream passes through: PII first, then secrets, the
/// inverse of the masking order. Either stage may be absent.
pub struct RestoreStages {
	pii: Option<StreamRestorer>,
	secret: Option<StreamRestorer>,
}

impl RestoreStages {
	pub fn new(pii: Option<StreamRestorer>, secret: Option<StreamRestorer>) -> Self {
		Self { pii, secret }
	}

	pub fn is_empty(&self) -> bool {
		self.pii.is_none() && self.secret.is_none()
	}

	fn push(&mut self, text: &str) -> String {
		let text = match &mut self.pii {
			Some(stage) => stage.push(text),
			None => text.to_string(),
		};
		match &mut self.secret {
			Some(stage) => stage.push(&text),
			None => text,
		}
	}

	fn flush(&mut self) -> String {
		let from_pii = match &mut self.pii {
			Some(stage) => stage.flush(),
			None => String::new(),
		};
		match &mut self.secret {
			Some(stage) => {
				let mut out = stage.push(&from_pii);
				out.push_str(&stage.flush());
				out
			},
			None => from_pii,
		}
	}
}

/// Per-stream state machine: framing knowledge plus the holdback stages.
struct SseTransform {
	framing: SseFraming,
	stages: RestoreStages,
	/// Last content block index seen, for the synthetic flush event.
	last_block_index: u64,
}

impl SseTransform {
	fn new(framing: SseFraming, stages: RestoreStages) -> Self {
		Self {
			framing,
			stages,
			last_block_index: 0,
		}
	}

	/// Process one complete input line into zero or more output lines.
	fn process_line(&mut self, line: &str) -> Vec<String> {
		let Some(data) = line.strip_prefix("data:") else {
			// event:/comment/blank lines frame the stream; forward verbatim.
			return vec![line.to_string()];
		};
		let data = data.strip_prefix(' ').unwrap_or(data);

		if self.framing == SseFraming::OpenAi && data.trim() == "[DONE]" {
			let mut out = self.flush_lines();
			out.push(line.to_string());
			return out;
		}

		let Ok(mut value) = serde_json::from_str::<Value>(data) else {
			debug!("passing through unparseable sse data line");
			return vec![line.to_string()];
		};

		let changed = match self.framing {
			SseFraming::OpenAi => self.rewrite_openai_delta(&mut value),
			SseFraming::Anthropic => self.rewrite_anthropic_delta(&mut value),
		};
		if !changed {
			// Byte-identical passthrough for frames we do not rewrite.
			return vec![line.to_string()];
		}
		vec![format!("data: {value}")]
	}

	fn rewrite_openai_delta(&mut self, value: &mut Value) -> bool {
		let Some(content) = value
			.get_mut("choices")
			.and_then(|c| c.get_mut(0))
			.and_then(|c| c.get_mut("delta"))
			.and_then(|d| d.get_mut("content"))
		else {
			return false;
		};
		let Value::String(text) = content else {
			return false;
		};
		*text = self.stages.push(text);
		true
	}

	fn rewrite_anthropic_delta(&mut self, value: &mut Value) -> bool {
		if value.get("type").and_then(Value::as_str) != Some("content_block_delta") {
			return false;
		}
		if let Some(index) = value.get("index").and_then(Value::as_u64) {
			self.last_block_index = index;
		}
		let Some(delta) = value.get_mut("delta") else {
			return false;
		};
		if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
			return false;
		}
		let Some(Value::String(text)) = delta.get_mut("text") else {
			return false;
		};
		*text = self.stages.push(text);
		true
	}

	/// Drain the holdback buffers into one synthetic data event in the
	/// stream's own framing. Empty when nothing was withheld.
	fn flush_lines(&mut self) -> Vec<String> {
		let rest = self.stages.flush();
		if rest.is_empty() {
			return Vec::new();
		}
		match self.framing {
			SseFraming::OpenAi => {
				let frame = serde_json::json!({
					"choices": [{"index": 0, "delta": {"content": rest}}]
				});
				vec![format!("data: {frame}"), String::new()]
			},
			SseFraming::Anthropic => {
				let frame = serde_json::json!({
					"type": "content_block_delta",
					"index": self.last_block_index,
					"delta": {"type": "text_delta", "text": rest}
				});
				vec![
					"event: content_block_delta".to_string(),
					format!("data: {frame}"),
					String::new(),
				]
			},
		}
	}
}

/// Wrap an upstream SSE body so every text payload is unmasked on the way
/// through.
///
/// The transform is a single pull-driven stage: it reads no faster than the
/// downstream consumer accepts, preserves event order, and closes the output
/// with the upstream error if one occurs (after emitting any bytes that were
/// already safe).
pub fn unmask_sse_body(body: Body, framing: SseFraming, stages: RestoreStages) -> Body {
	if stages.is_empty() {
		return body;
	}
	let mut transform = SseTransform::new(framing, stages);
	let reader = StreamReader::new(
		body
			.into_data_stream()
			.map(|res| res.map_err(io::Error::other)),
	);
	let mut lines = FramedRead::new(reader, SseLineCodec {
		max_line_bytes: MAX_LINE_BYTES,
	});

	let stream: std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<Bytes, io::Error>> + Send>> =
		Box::pin(try_stream! {
		loop {
			match lines.next().await {
				Some(Ok(line)) => {
					for out in transform.process_line(&line) {
						yield Bytes::from(format!("{out}\n"));
					}
				},
				Some(Err(e)) => {
					// Emit what is already safe, then fail the stream.
					for out in transform.flush_lines() {
						yield Bytes::from(format!("{out}\n"));
					}
					Err(e)?;
				},
				None => {
					for out in transform.flush_lines() {
						yield Bytes::from(format!("{out}\n"));
					}
					break;
				},
			}
		}
	});
	Body::from_stream(stream)
}

#[cfg(test)]
#[path = "sse_tests.rs"]
mod tests;
