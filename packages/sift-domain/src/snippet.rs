use std::collections::HashSet;

use unicode_segmentation::UnicodeSegmentation;

const ELLIPSIS: &str = "...";

/// Extracts at most `max_chars` characters of `text` around the densest cluster of
/// `terms` matches. Falls back to the head of the text when nothing matches.
///
/// `terms` are expected lower-cased. Ellipses mark truncated edges and are not counted in
/// `max_chars`.
pub fn extract_snippet(text: &str, terms: &[String], max_chars: usize) -> String {
	let text = text.trim();

	if max_chars == 0 || text.is_empty() {
		return String::new();
	}

	let boundaries: Vec<usize> = text.char_indices().map(|(idx, _)| idx).collect();
	let total = boundaries.len();

	if total <= max_chars {
		return text.to_string();
	}

	let hits = match_positions(text, terms, &boundaries);
	let start = if hits.is_empty() { 0 } else { densest_window_start(&hits, max_chars, total) };
	let end = (start + max_chars).min(total);
	let byte_start = boundaries[start];
	let byte_end = if end >= total { text.len() } else { boundaries[end] };
	let mut out = String::with_capacity(byte_end - byte_start + ELLIPSIS.len() * 2);

	if start > 0 {
		out.push_str(ELLIPSIS);
	}

	out.push_str(text[byte_start..byte_end].trim());

	if end < total {
		out.push_str(ELLIPSIS);
	}

	out
}

/// Character offsets of words in `text` that equal one of `terms`, ascending.
fn match_positions(text: &str, terms: &[String], boundaries: &[usize]) -> Vec<usize> {
	if terms.is_empty() {
		return Vec::new();
	}

	let wanted: HashSet<&str> = terms.iter().map(String::as_str).collect();
	let mut out = Vec::new();

	for (byte_idx, word) in text.unicode_word_indices() {
		let lowered: String = word.chars().flat_map(char::to_lowercase).collect();

		if !wanted.contains(lowered.as_str()) {
			continue;
		}
		if let Ok(char_idx) = boundaries.binary_search(&byte_idx) {
			out.push(char_idx);
		}
	}

	out
}

fn densest_window_start(hits: &[usize], max_chars: usize, total: usize) -> usize {
	let mut best_first = 0;
	let mut best_last = 0;
	let mut best_count = 0;
	let mut right = 0;

	for left in 0..hits.len() {
		while right < hits.len() && hits[right] < hits[left] + max_chars {
			right += 1;
		}

		let count = right - left;

		if count > best_count {
			best_count = count;
			best_first = left;
			best_last = right - 1;
		}
	}

	let span = hits[best_last] - hits[best_first];
	let lead = max_chars.saturating_sub(span) / 2;

	hits[best_first].saturating_sub(lead).min(total - max_chars)
}
