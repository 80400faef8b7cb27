use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Half-open interval `[start, end)` over the code points of one text buffer.
///
/// Every offset in the detection pipeline is a code-point index: the external
/// analyzer reports Python-style string offsets, and the replacement engine
/// slices by the same unit. Byte offsets never cross a module boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
	pub start: usize,
	pub end: usize,
}

impl Span {
	pub fn new(start: usize, end: usize) -> Self {
		Self { start, end }
	}

	pub fn len(&self) -> usize {
		self.end.saturating_sub(self.start)
	}

	pub fn is_empty(&self) -> bool {
		self.end <= self.start
	}

	/// Strict overlap: the intervals share at least one position.
	pub fn overlaps(&self, other: &Span) -> bool {
		self.start < other.end && other.start < self.end
	}
}

/// An entity reported by the PII analyzer, with its confidence score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntity {
	pub entity_type: String,
	pub start: usize,
	pub end: usize,
	pub score: f64,
}

impl ScoredEntity {
	pub fn span(&self) -> Span {
		Span::new(self.start, self.end)
	}
}

/// Resolve overlapping analyzer findings into a non-overlapping set.
///
/// Same-type overlaps are merged into their union (keeping the best score);
/// cross-type overlaps are resolved by keeping the highest-scoring (then
/// longest, then leftmost) span and dropping anything it overlaps.
pub fn resolve_conflicts(entities: &[ScoredEntity]) -> Vec<ScoredEntity> {
	if entities.len() <= 1 {
		return entities.to_vec();
	}

	// Group by type, preserving first-seen type order for determinism.
	let mut groups: IndexMap<&str, Vec<&ScoredEntity>> = IndexMap::new();
	for e in entities {
		groups.entry(e.entity_type.as_str()).or_default().push(e);
	}

	let mut merged: Vec<ScoredEntity> = Vec::with_capacity(entities.len());
	for (_, mut group) in groups {
		group.sort_by_key(|e| e.start);
		let mut iter = group.into_iter();
		let first = iter.next().expect("group is non-empty");
		let mut current = first.clone();
		for e in iter {
			if current.span().overlaps(&e.span()) {
				current.start = current.start.min(e.start);
				current.end = current.end.max(e.end);
				current.score = current.score.max(e.score);
			} else {
				merged.push(std::mem::replace(&mut current, e.clone()));
			}
		}
		merged.push(current);
	}

	// Cross-type: best score wins, longer spans break ties, then leftmost.
	merged.sort_by(|a, b| {
		b.score
			.total_cmp(&a.score)
			.then_with(|| b.span().len().cmp(&a.span().len()))
			.then_with(|| a.start.cmp(&b.start))
	});

	let mut accepted: Vec<ScoredEntity> = Vec::with_capacity(merged.len());
	for candidate in merged {
		if accepted
			.iter()
			.all(|a| !a.span().overlaps(&candidate.span()))
		{
			accepted.push(candidate);
		}
	}
	accepted.sort_by_key(|e| e.start);
	accepted
}

/// First-fit resolution for unscored spans (the secrets path): sort by
/// `(start asc, length desc)` and drop anything starting inside an already
/// accepted span.
pub fn resolve_overlaps<T, F>(items: &[T], span_of: F) -> Vec<T>
where
	T: Clone,
	F: Fn(&T) -> Span,
{
	if items.len() <= 1 {
		return items.to_vec();
	}
	let mut sorted: Vec<&T> = items.iter().collect();
	sorted.sort_by(|a, b| {
		let (sa, sb) = (span_of(a), span_of(b));
		sa.start
			.cmp(&sb.start)
			.then_with(|| sb.len().cmp(&sa.len()))
	});

	let mut accepted: Vec<T> = Vec::with_capacity(sorted.len());
	let mut last_end = 0usize;
	let mut any = false;
	for item in sorted {
		let span = span_of(item);
		if !any || span.start >= last_end {
			last_end = span.end;
			any = true;
			accepted.push((*item).clone());
		}
	}
	accepted
}

/// Map a code-point offset to the byte offset in `text`.
///
/// Offsets past the end clamp to `text.len()`, matching how analyzer results
/// that extend to end-of-string behave.
pub fn char_to_byte(text: &str, char_idx: usize) -> usize {
	text
		.char_indices()
		.nth(char_idx)
		.map(|(b, _)| b)
		.unwrap_or(text.len())
}

/// Map a byte offset (as produced by the regex engine) to a code-point offset.
pub fn byte_to_char(text: &str, byte_idx: usize) -> usize {
	text[..byte_idx.min(text.len())].chars().count()
}

/// Slice `text` by a code-point range.
pub fn slice_chars(text: &str, start: usize, end: usize) -> &str {
	let b_start = char_to_byte(text, start);
	let b_end = char_to_byte(text, end);
	&text[b_start..b_end]
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entity(entity_type: &str, start: usize, end: usize, score: f64) -> ScoredEntity {
		ScoredEntity {
			entity_type: entity_type.to_string(),
			start,
			end,
			score,
		}
	}

	fn assert_non_overlapping(entities: &[ScoredEntity]) {
		for (i, a) in entities.iter().enumerate() {
			for b in &entities[i + 1..] {
				assert!(
					!a.span().overlaps(&b.span()),
					"{a:?} overlaps {b:?}"
				);
			}
		}
	}

	#[test]
	fn empty_and_single_inputs_are_copied() {
		assert!(resolve_conflicts(&[]).is_empty());
		let one = vec![entity("PERSON", 0, 4, 0.9)];
		assert_eq!(resolve_conflicts(&one), one);

		let single = vec![Span::new(3, 9)];
		assert_eq!(resolve_overlaps(&single, |s| *s), single);
	}

	#[test]
	fn same_type_overlaps_merge_to_union() {
		let input = vec![
			entity("PERSON", 0, 5, 0.6),
			entity("PERSON", 3, 10, 0.9),
			entity("PERSON", 20, 25, 0.7),
		];
		let out = resolve_conflicts(&input);
		assert_eq!(out.len(), 2);
		assert_eq!((out[0].start, out[0].end), (0, 10));
		assert_eq!(out[0].score, 0.9);
		assert_eq!((out[1].start, out[1].end), (20, 25));
	}

	#[test]
	fn cross_type_overlap_keeps_best_score() {
		let input = vec![
			entity("PERSON", 0, 10, 0.5),
			entity("EMAIL_ADDRESS", 5, 15, 0.9),
		];
		let out = resolve_conflicts(&input);
		assert_eq!(out.len(), 1);
		assert_eq!(out[0].entity_type, "EMAIL_ADDRESS");
	}

	#[test]
	fn cross_type_tie_prefers_longer_span() {
		let input = vec![
			entity("PHONE_NUMBER", 0, 6, 0.8),
			entity("US_SSN", 2, 13, 0.8),
		];
		let out = resolve_conflicts(&input);
		assert_eq!(out.len(), 1);
		assert_eq!(out[0].entity_type, "US_SSN");
	}

	#[test]
	fn non_overlapping_cross_type_all_survive() {
		let input = vec![
			entity("PERSON", 8, 19, 0.9),
			entity("EMAIL_ADDRESS", 23, 36, 1.0),
		];
		let out = resolve_conflicts(&input);
		assert_eq!(out.len(), 2);
		assert_non_overlapping(&out);
	}

	#[test]
	fn adjacent_spans_do_not_merge() {
		// Half-open intervals: [0,5) and [5,8) share no position.
		let input = vec![
			entity("PERSON", 0, 5, 0.9),
			entity("PERSON", 5, 8, 0.8),
		];
		let out = resolve_conflicts(&input);
		assert_eq!(out.len(), 2);
	}

	#[test]
	fn overlap_chains_merge_transitively() {
		let input = vec![
			entity("PERSON", 0, 4, 0.5),
			entity("PERSON", 3, 8, 0.6),
			entity("PERSON", 7, 12, 0.7),
		];
		let out = resolve_conflicts(&input);
		assert_eq!(out.len(), 1);
		assert_eq!((out[0].start, out[0].end), (0, 12));
		assert_eq!(out[0].score, 0.7);
	}

	#[test]
	fn resolve_conflicts_does_not_mutate_input() {
		let input = vec![
			entity("PERSON", 0, 5, 0.6),
			entity("PERSON", 3, 10, 0.9),
		];
		let before = input.clone();
		let _ = resolve_conflicts(&input);
		assert_eq!(input, before);
	}

	#[test]
	fn resolve_overlaps_first_fit() {
		let spans = vec![
			Span::new(10, 20),
			Span::new(0, 30),
			Span::new(0, 5),
			Span::new(30, 40),
		];
		let out = resolve_overlaps(&spans, |s| *s);
		// (0,30) wins at start 0 (longer than (0,5)); (10,20) is nested and
		// dropped; (30,40) starts at the previous end and survives.
		assert_eq!(out, vec![Span::new(0, 30), Span::new(30, 40)]);
	}

	#[test]
	fn char_byte_round_trips_on_multibyte_text() {
		let text = "Hans Müller";
		assert_eq!(byte_to_char(text, text.len()), 11);
		assert_eq!(char_to_byte(text, 11), text.len());
		assert_eq!(slice_chars(text, 5, 11), "Müller");
	}

	#[test]
	fn out_of_range_offsets_clamp_to_the_end() {
		let text = "abc";
		assert_eq!(char_to_byte(text, 99), 3);
		assert_eq!(byte_to_char(text, 99), 3);
		assert_eq!(slice_chars(text, 1, 99), "bc");
	}
}
