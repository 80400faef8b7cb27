use std::collections::HashMap;

use indexmap::IndexMap;
use serde::Serialize;

use crate::detect::span::{Span, char_to_byte};

/// Which placeholder family a masked value belongs to.
///
/// The wire formats are fixed: `[[TYPE_N]]` for analyzer entities and
/// `[[SECRET_MASKED_TYPE_N]]` for deterministic secret findings. The `[[`
/// and `]]` delimiters are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
	Pii,
	Secret,
}

impl PlaceholderKind {
	pub fn format(&self, label: &str, count: u64) -> String {
		match self {
			PlaceholderKind::Pii => format!("[[{label}_{count}]]"),
			PlaceholderKind::Secret => format!("[[SECRET_MASKED_{label}_{count}]]"),
		}
	}
}

/// Request-scoped side table binding placeholders to the values they stand
/// in for.
///
/// One context lives for exactly one inbound request (including its streamed
/// response) and is never shared across requests. The masking pass writes it
/// before the upstream call; the response path only reads it.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PlaceholderContext {
	/// placeholder -> original, in insertion order.
	mapping: IndexMap<String, String>,
	/// original -> placeholder, for dedup of repeated values.
	#[serde(skip)]
	reverse: HashMap<String, String>,
	/// Last issued index per type label.
	counters: HashMap<String, u64>,
}

impl PlaceholderContext {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seed the per-type counters, e.g. from the `/api/mask` `startFrom`
	/// field. Numbering continues after the seeded values.
	pub fn with_counters(counters: HashMap<String, u64>) -> Self {
		Self {
			counters,
			..Default::default()
		}
	}

	/// Increment the counter for `label` (from 0 if absent) and mint the
	/// next placeholder of the given kind.
	pub fn increment_and_generate(&mut self, kind: PlaceholderKind, label: &str) -> String {
		let counter = self.counters.entry(label.to_string()).or_insert(0);
		*counter += 1;
		kind.format(label, *counter)
	}

	pub fn mapping(&self) -> &IndexMap<String, String> {
		&self.mapping
	}

	pub fn counters(&self) -> &HashMap<String, u64> {
		&self.counters
	}

	pub fn is_empty(&self) -> bool {
		self.mapping.is_empty()
	}

	pub fn placeholder_for(&self, original: &str) -> Option<&str> {
		self.reverse.get(original).map(|s| s.as_str())
	}

	pub fn record_pair(&mut self, placeholder: String, original: String) {
		self
			.reverse
			.insert(original.clone(), placeholder.clone());
		self.mapping.insert(placeholder, original);
	}
}

/// An item the replacement engine can mask: a located span plus the type
/// label used for placeholder naming.
pub trait Maskable {
	fn span(&self) -> Span;
	fn type_label(&self) -> &str;
}

impl Maskable for crate::detect::span::ScoredEntity {
	fn span(&self) -> Span {
		Span::new(self.start, self.end)
	}

	fn type_label(&self) -> &str {
		&self.entity_type
	}
}

/// Replace every accepted span in `text` with a placeholder, recording the
/// bidirectional mapping in `ctx`.
///
/// `resolve` reduces the raw findings to a non-overlapping accepted set.
/// Placeholders are assigned in ascending span order so numbering follows
/// reading order; identical source values reuse the placeholder already
/// minted in this context. The actual splice runs in descending span order,
/// which keeps the not-yet-replaced offsets valid.
pub fn replace_with_placeholders<T, R>(
	text: &str,
	items: &[T],
	ctx: &mut PlaceholderContext,
	kind: PlaceholderKind,
	resolve: R,
) -> String
where
	T: Maskable + Clone,
	R: FnOnce(&[T]) -> Vec<T>,
{
	if items.is_empty() {
		return text.to_string();
	}
	let mut accepted = resolve(items);
	accepted.sort_by_key(|i| i.span().start);
	accepted.retain(|i| !i.span().is_empty() && i.span().end <= text.chars().count());

	let mut replacements: Vec<(Span, String)> = Vec::with_capacity(accepted.len());
	for item in &accepted {
		let span = item.span();
		let byte_start = char_to_byte(text, span.start);
		let byte_end = char_to_byte(text, span.end);
		let original = &text[byte_start..byte_end];
		let placeholder = match ctx.placeholder_for(original) {
			Some(existing) => existing.to_string(),
			None => {
				let minted = ctx.increment_and_generate(kind, item.type_label());
				ctx.record_pair(minted.clone(), original.to_string());
				minted
			},
		};
		replacements.push((Span::new(byte_start, byte_end), placeholder));
	}

	let mut out = text.to_string();
	for (span, placeholder) in replacements.iter().rev() {
		out.replace_range(span.start..span.end, placeholder);
	}
	out
}

/// Restore every placeholder recorded in `ctx` back to its original value.
///
/// Keys are applied longest-first so `[[X_1]]` can never corrupt `[[X_12]]`;
/// matching is exact substring replacement of all occurrences.
pub fn restore_placeholders<F>(text: &str, ctx: &PlaceholderContext, format_value: F) -> String
where
	F: Fn(&str) -> String,
{
	if ctx.is_empty() || !text.contains("[[") {
		return text.to_string();
	}
	let mut keys: Vec<&String> = ctx.mapping.keys().collect();
	keys.sort_by_key(|k| std::cmp::Reverse(k.len()));

	let mut out = text.to_string();
	for key in keys {
		if !out.contains(key.as_str()) {
			continue;
		}
		let original = &ctx.mapping[key.as_str()];
		out = out.replace(key.as_str(), &format_value(original));
	}
	out
}

/// The identity value formatter for [`restore_placeholders`].
pub fn identity(value: &str) -> String {
	value.to_string()
}

/// Recover the type label from a wire placeholder: `[[EMAIL_ADDRESS_2]]`
/// gives `EMAIL_ADDRESS`, `[[SECRET_MASKED_JWT_TOKEN_1]]` gives `JWT_TOKEN`.
pub fn placeholder_label(placeholder: &str) -> Option<&str> {
	let inner = placeholder.strip_prefix("[[")?.strip_suffix("]]")?;
	let (label, counter) = inner.rsplit_once('_')?;
	if counter.is_empty() || !counter.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	Some(label.strip_prefix("SECRET_MASKED_").unwrap_or(label))
}
