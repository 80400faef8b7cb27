use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::extract::{MaskedSpan, RequestExtractor, SYSTEM_MESSAGE_INDEX, TextSpan};
use crate::mask::PlaceholderContext;
use crate::mask::placeholder::restore_placeholders;

/// Anthropic messages request, permissive passthrough like the OpenAI shape.
/// The top-level system prompt addresses at `message_index = -1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub system: Option<SystemContent>,
	pub messages: Vec<MessageItem>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(flatten, default)]
	pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemContent {
	Text(String),
	Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageItem {
	pub role: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<MessageContent>,
	#[serde(flatten, default)]
	pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
	Text(String),
	Blocks(Vec<ContentBlock>),
}

/// One content block. `text` carries `type == "text"` payloads; `content`
/// carries the nested body of a `tool_result`. Everything else (images,
/// tool_use input, thinking signatures, redacted data) stays in `rest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
	pub r#type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<NestedContent>,
	#[serde(flatten, default)]
	pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NestedContent {
	Text(String),
	Blocks(Vec<NestedBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NestedBlock {
	pub r#type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
	#[serde(flatten, default)]
	pub rest: Map<String, Value>,
}

/// Anthropic messages response (non-streaming).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
	#[serde(default)]
	pub content: Vec<ContentBlock>,
	#[serde(flatten, default)]
	pub rest: Map<String, Value>,
}

pub struct AnthropicExtractor;

impl AnthropicExtractor {
	fn block_spans(
		spans: &mut Vec<TextSpan>,
		blocks: &[ContentBlock],
		message_index: i64,
		path_prefix: &str,
		role: Option<&str>,
	) {
		for (j, block) in blocks.iter().enumerate() {
			if block.r#type == "text" {
				if let Some(text) = block.text.as_ref().filter(|t| !t.is_empty()) {
					spans.push(TextSpan {
						text: text.clone(),
						path: format!("{path_prefix}[{j}]"),
						message_index,
						part_index: j,
						nested_part_index: None,
						role: role.map(|r| r.to_string()),
					});
				}
				continue;
			}
			if block.r#type == "tool_result" {
				match &block.content {
					Some(NestedContent::Text(text)) if !text.is_empty() => {
						spans.push(TextSpan {
							text: text.clone(),
							path: format!("{path_prefix}[{j}].content"),
							message_index,
							part_index: j,
							nested_part_index: None,
							role: role.map(|r| r.to_string()),
						});
					},
					Some(NestedContent::Blocks(nested)) => {
						for (k, inner) in nested.iter().enumerate() {
							if inner.r#type != "text" {
								continue;
							}
							let Some(text) = inner.text.as_ref().filter(|t| !t.is_empty()) else {
								continue;
							};
							spans.push(TextSpan {
								text: text.clone(),
								path: format!("{path_prefix}[{j}].content[{k}]"),
								message_index,
								part_index: j,
								nested_part_index: Some(k),
								role: role.map(|r| r.to_string()),
							});
						}
					},
					_ => {},
				}
			}
		}
	}

	fn apply_to_blocks(blocks: &mut [ContentBlock], masked: &MaskedSpan) {
		let addr = masked.address;
		let Some(block) = blocks.get_mut(addr.part_index) else {
			return;
		};
		match addr.nested_part_index {
			None => {
				if block.r#type == "text" && block.text.is_some() {
					block.text = Some(masked.masked_text.clone());
				} else if block.r#type == "tool_result"
					&& matches!(block.content, Some(NestedContent::Text(_)))
				{
					block.content = Some(NestedContent::Text(masked.masked_text.clone()));
				}
			},
			Some(k) => {
				if block.r#type == "tool_result"
					&& let Some(NestedContent::Blocks(nested)) = &mut block.content
					&& let Some(inner) = nested.get_mut(k)
					&& inner.r#type == "text"
					&& inner.text.is_some()
				{
					inner.text = Some(masked.masked_text.clone());
				}
			},
		}
	}
}

impl RequestExtractor for AnthropicExtractor {
	type Request = MessagesRequest;
	type Response = MessagesResponse;

	fn extract_texts(req: &Self::Request) -> Vec<TextSpan> {
		let mut spans = Vec::new();
		match &req.system {
			Some(SystemContent::Text(text)) if !text.is_empty() => {
				spans.push(TextSpan {
					text: text.clone(),
					path: "system".to_string(),
					message_index: SYSTEM_MESSAGE_INDEX,
					part_index: 0,
					nested_part_index: None,
					role: Some("system".to_string()),
				});
			},
			Some(SystemContent::Blocks(blocks)) => {
				Self::block_spans(
					&mut spans,
					blocks,
					SYSTEM_MESSAGE_INDEX,
					"system",
					Some("system"),
				);
			},
			_ => {},
		}
		for (i, msg) in req.messages.iter().enumerate() {
			match &msg.content {
				Some(MessageContent::Text(text)) if !text.is_empty() => {
					spans.push(TextSpan {
						text: text.clone(),
						path: format!("messages[{i}].content"),
						message_index: i as i64,
						part_index: 0,
						nested_part_index: None,
						role: Some(msg.role.clone()),
					});
				},
				Some(MessageContent::Blocks(blocks)) => {
					Self::block_spans(
						&mut spans,
						blocks,
						i as i64,
						&format!("messages[{i}].content"),
						Some(&msg.role),
					);
				},
				_ => {},
			}
		}
		spans
	}

	fn apply_masked(req: &Self::Request, spans: &[MaskedSpan]) -> Self::Request {
		let mut out = req.clone();
		for masked in spans {
			let addr = masked.address;
			if addr.message_index == SYSTEM_MESSAGE_INDEX {
				match &mut out.system {
					Some(SystemContent::Text(text)) if addr.part_index == 0 => {
						*text = masked.masked_text.clone();
					},
					Some(SystemContent::Blocks(blocks)) => {
						Self::apply_to_blocks(blocks, masked);
					},
					_ => {},
				}
				continue;
			}
			let Some(msg) = usize::try_from(addr.message_index)
				.ok()
				.and_then(|i| out.messages.get_mut(i))
			else {
				continue;
			};
			match &mut msg.content {
				Some(MessageContent::Text(text)) if addr.part_index == 0 => {
					*text = masked.masked_text.clone();
				},
				Some(MessageContent::Blocks(blocks)) => {
					Self::apply_to_blocks(blocks, masked);
				},
				_ => {},
			}
		}
		out
	}

	fn is_streaming(req: &Self::Request) -> bool {
		req.stream.unwrap_or_default()
	}

	fn set_model(req: &mut Self::Request, model: &str) {
		req.model = Some(model.to_string());
	}

	fn unmask_response(
		resp: &mut Self::Response,
		ctx: &PlaceholderContext,
		format_value: &dyn Fn(&str) -> String,
	) {
		for block in &mut resp.content {
			if block.r#type == "text"
				&& let Some(text) = &mut block.text
			{
				*text = restore_placeholders(text, ctx, format_value);
			}
		}
	}
}

#[cfg(test)]
#[path = "anthropic_tests.rs"]
mod tests;
