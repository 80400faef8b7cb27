use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::extract::{MaskedSpan, RequestExtractor, TextSpan};
use crate::mask::PlaceholderContext;
use crate::mask::placeholder::restore_placeholders;

/// OpenAI chat-completions request, permissive: every key we do not model
/// rides along in `rest` and is forwarded byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	pub messages: Vec<ChatMessage>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(flatten, default)]
	pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
	pub role: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<MessageContent>,
	#[serde(flatten, default)]
	pub rest: Map<String, Value>,
}

/// Message content is either a bare string or a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
	Text(String),
	Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
	pub r#type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
	#[serde(flatten, default)]
	pub rest: Map<String, Value>,
}

/// OpenAI chat-completions response (non-streaming).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
	#[serde(default)]
	pub choices: Vec<Choice>,
	#[serde(flatten, default)]
	pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<ResponseMessage>,
	#[serde(flatten, default)]
	pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub role: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(flatten, default)]
	pub rest: Map<String, Value>,
}

pub struct OpenAiExtractor;

impl RequestExtractor for OpenAiExtractor {
	type Request = ChatRequest;
	type Response = ChatResponse;

	fn extract_texts(req: &Self::Request) -> Vec<TextSpan> {
		let mut spans = Vec::new();
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
				Some(MessageContent::Parts(parts)) => {
					for (j, part) in parts.iter().enumerate() {
						if part.r#type != "text" {
							continue;
						}
						let Some(text) = part.text.as_ref().filter(|t| !t.is_empty()) else {
							continue;
						};
						spans.push(TextSpan {
							text: text.clone(),
							path: format!("messages[{i}].content[{j}]"),
							message_index: i as i64,
							part_index: j,
							nested_part_index: None,
							role: Some(msg.role.clone()),
						});
					}
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
				Some(MessageContent::Parts(parts)) => {
					if let Some(part) = parts.get_mut(addr.part_index)
						&& part.r#type == "text"
						&& part.text.is_some()
					{
						part.text = Some(masked.masked_text.clone());
					}
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
		for choice in &mut resp.choices {
			if let Some(message) = &mut choice.message
				&& let Some(content) = &mut message.content
			{
				*content = restore_placeholders(content, ctx, format_value);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::extract::SpanAddress;
	use crate::mask::PlaceholderKind;

	fn request(value: Value) -> ChatRequest {
		serde_json::from_value(value).unwrap()
	}

	#[test]
	fn extracts_string_and_part_content() {
		let req = request(json!({
			"model": "gpt-4o",
			"messages": [
				{"role": "system", "content": "be nice"},
				{"role": "user", "content": [
					{"type": "text", "text": "hello"},
					{"type": "image_url", "image_url": {"url": "http://x/y.png"}},
					{"type": "text", "text": "world"}
				]},
				{"role": "assistant", "content": ""}
			]
		}));
		let spans = OpenAiExtractor::extract_texts(&req);
		assert_eq!(spans.len(), 3);
		assert_eq!(spans[0].text, "be nice");
		assert_eq!(spans[0].message_index, 0);
		assert_eq!(spans[1].text, "hello");
		assert_eq!((spans[1].message_index, spans[1].part_index), (1, 0));
		assert_eq!((spans[2].message_index, spans[2].part_index), (1, 2));
		assert_eq!(spans[1].role.as_deref(), Some("user"));
	}

	#[test]
	fn empty_strings_yield_no_span() {
		let req = request(json!({
			"messages": [{"role": "user", "content": ""}]
		}));
		assert!(OpenAiExtractor::extract_texts(&req).is_empty());
	}

	#[test]
	fn apply_with_no_spans_is_identity() {
		let raw = json!({
			"model": "gpt-4o",
			"temperature": 0.5,
			"tool_choice": "auto",
			"messages": [
				{"role": "user", "content": "hi", "name": "alice"}
			]
		});
		let req = request(raw.clone());
		let applied = OpenAiExtractor::apply_masked(&req, &[]);
		assert_eq!(serde_json::to_value(&applied).unwrap(), raw);
	}

	#[test]
	fn apply_replaces_only_addressed_text() {
		let req = request(json!({
			"messages": [
				{"role": "user", "content": [
					{"type": "text", "text": "secret"},
					{"type": "image_url", "image_url": {"url": "http://x"}}
				]}
			]
		}));
		let masked = vec![MaskedSpan {
			address: SpanAddress {
				message_index: 0,
				part_index: 0,
				nested_part_index: None,
			},
			masked_text: "[[PERSON_1]]".to_string(),
		}];
		let out = OpenAiExtractor::apply_masked(&req, &masked);
		let value = serde_json::to_value(&out).unwrap();
		assert_eq!(value["messages"][0]["content"][0]["text"], "[[PERSON_1]]");
		assert_eq!(
			value["messages"][0]["content"][1]["image_url"]["url"],
			"http://x"
		);
	}

	#[test]
	fn addresses_into_non_text_blocks_are_ignored() {
		let req = request(json!({
			"messages": [
				{"role": "user", "content": [
					{"type": "image_url", "image_url": {"url": "http://x"}}
				]}
			]
		}));
		let masked = vec![MaskedSpan {
			address: SpanAddress {
				message_index: 0,
				part_index: 0,
				nested_part_index: None,
			},
			masked_text: "oops".to_string(),
		}];
		let out = OpenAiExtractor::apply_masked(&req, &masked);
		assert_eq!(
			serde_json::to_value(&out).unwrap(),
			serde_json::to_value(&req).unwrap()
		);
	}

	#[test]
	fn assistant_tool_call_messages_pass_through() {
		let raw = json!({
			"model": "gpt-4o",
			"messages": [
				{"role": "user", "content": "look it up"},
				{"role": "assistant", "content": null, "tool_calls": [
					{"id": "call_1", "type": "function",
					 "function": {"name": "search", "arguments": "{\"q\":\"x\"}"}}
				]},
				{"role": "tool", "tool_call_id": "call_1", "content": "result text"}
			]
		});
		let req = request(raw.clone());
		let spans = OpenAiExtractor::extract_texts(&req);
		// The assistant message has no text; the tool result does.
		assert_eq!(spans.len(), 2);
		assert_eq!(spans[1].role.as_deref(), Some("tool"));
		assert_eq!(spans[1].text, "result text");

		let value = serde_json::to_value(&req).unwrap();
		assert_eq!(value["messages"][1]["tool_calls"][0]["id"], "call_1");
	}

	#[test]
	fn unknown_request_keys_survive_round_trip() {
		let raw = json!({
			"model": "gpt-4o",
			"messages": [{"role": "user", "content": "hi"}],
			"metadata": {"trace": "abc"},
			"some_future_field": [1, 2, 3]
		});
		let req = request(raw.clone());
		assert_eq!(serde_json::to_value(&req).unwrap(), raw);
	}

	#[test]
	fn unmask_restores_choice_content() {
		let mut ctx = PlaceholderContext::new();
		let p = ctx.increment_and_generate(PlaceholderKind::Pii, "EMAIL_ADDRESS");
		ctx.record_pair(p, "a@b.com".to_string());

		let mut resp: ChatResponse = serde_json::from_value(json!({
			"id": "chatcmpl-1",
			"choices": [
				{"index": 0, "message": {"role": "assistant", "content": "mail [[EMAIL_ADDRESS_1]]"}, "finish_reason": "stop"}
			],
			"usage": {"total_tokens": 10}
		}))
		.unwrap();
		OpenAiExtractor::unmask_response(&mut resp, &ctx, &|v| v.to_string());
		let value = serde_json::to_value(&resp).unwrap();
		assert_eq!(value["choices"][0]["message"]["content"], "mail a@b.com");
		assert_eq!(value["usage"]["total_tokens"], 10);
	}
}
