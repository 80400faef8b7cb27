use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::mask::PlaceholderContext;

pub mod anthropic;
pub mod openai;

/// Index of the message a span came from. `SYSTEM_MESSAGE_INDEX` marks
/// content living outside the `messages` array (a top-level system prompt).
pub const SYSTEM_MESSAGE_INDEX: i64 = -1;

/// An addressable chunk of request text.
///
/// `(message_index, part_index, nested_part_index)` is the address used to
/// write masked text back onto the request; `path` is only for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
	pub text: String,
	pub path: String,
	pub message_index: i64,
	pub part_index: usize,
	pub nested_part_index: Option<usize>,
	pub role: Option<String>,
}

impl TextSpan {
	pub fn address(&self) -> SpanAddress {
		SpanAddress {
			message_index: self.message_index,
			part_index: self.part_index,
			nested_part_index: self.nested_part_index,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanAddress {
	pub message_index: i64,
	pub part_index: usize,
	pub nested_part_index: Option<usize>,
}

/// Replacement text for the span at `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskedSpan {
	pub address: SpanAddress,
	pub masked_text: String,
}

/// Wire-format adapter: everything downstream of this trait is shape
/// agnostic.
///
/// `apply_masked` over an unchanged set of addresses is structurally
/// lossless, and addresses that do not resolve to a text block are ignored
/// so non-text content always passes through verbatim.
pub trait RequestExtractor {
	type Request: Clone + Serialize + DeserializeOwned + Send;
	type Response: Serialize + DeserializeOwned + Send;

	fn extract_texts(req: &Self::Request) -> Vec<TextSpan>;

	fn apply_masked(req: &Self::Request, spans: &[MaskedSpan]) -> Self::Request;

	fn is_streaming(req: &Self::Request) -> bool;

	fn set_model(req: &mut Self::Request, model: &str);

	fn unmask_response(
		resp: &mut Self::Response,
		ctx: &PlaceholderContext,
		format_value: &dyn Fn(&str) -> String,
	);
}
