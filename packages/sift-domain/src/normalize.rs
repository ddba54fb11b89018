use unicode_normalization::UnicodeNormalization;

/// Canonical form of a question used for fingerprints and similarity: NFKC, lower-cased,
/// whitespace runs collapsed to a single space, trimmed.
pub fn normalize_query(raw: &str) -> String {
	let composed: String = raw.nfkc().collect();
	let mut out = String::with_capacity(composed.len());

	for word in composed.split_whitespace() {
		if !out.is_empty() {
			out.push(' ');
		}

		out.extend(word.chars().flat_map(char::to_lowercase));
	}

	out
}

pub fn is_blank(raw: &str) -> bool {
	raw.chars().all(char::is_whitespace)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lowercases_and_collapses_whitespace() {
		assert_eq!(normalize_query("  How do I\tconfigure \n backups?  "), "how do i configure backups?");
	}

	#[test]
	fn is_idempotent() {
		let once = normalize_query("Rotate   the KEYS now");

		assert_eq!(normalize_query(&once), once);
	}

	#[test]
	fn folds_fullwidth_latin() {
		assert_eq!(normalize_query("Ｂａｃｋｕｐ"), "backup");
	}

	#[test]
	fn blank_detection() {
		assert!(is_blank(" \t\n"));
		assert!(is_blank(""));
		assert!(!is_blank(" a "));
	}
}
