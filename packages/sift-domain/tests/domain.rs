use sift_domain::{normalize::normalize_query, snippet::extract_snippet, tokens::TokenSet};

#[test]
fn case_and_whitespace_variants_share_tokens() {
	let cached = TokenSet::from_normalized(&normalize_query("How do I configure backups?"));
	let incoming = TokenSet::from_normalized(&normalize_query("how do i configure backups"));

	assert_eq!(cached.jaccard(&incoming), 1.0);
}

#[test]
fn token_set_serializes_as_plain_array() {
	let tokens = TokenSet::from_normalized("rotate the keys");
	let json = serde_json::to_value(&tokens).expect("Failed to encode tokens.");

	assert_eq!(json, serde_json::json!(["keys", "rotate", "the"]));

	let decoded: TokenSet = serde_json::from_value(json).expect("Failed to decode tokens.");

	assert_eq!(decoded, tokens);
}

#[test]
fn snippet_uses_normalized_query_terms() {
	let query = normalize_query("Retention POLICY");
	let terms = TokenSet::from_normalized(&query).into_inner();
	let text = format!("{} The retention policy keeps nightly copies. {}", "x ".repeat(200), "y ".repeat(200));
	let snippet = extract_snippet(&text, &terms, 48);

	assert!(snippet.contains("retention policy"), "{snippet}");
}

#[test]
fn decoding_restores_sorted_unique_tokens() {
	let stored = serde_json::json!(["rotate", "keys", "the", "keys"]);
	let decoded: TokenSet = serde_json::from_value(stored).expect("Failed to decode tokens.");
	let fresh = TokenSet::from_normalized("rotate the keys");

	assert_eq!(decoded, fresh);
	assert_eq!(decoded.jaccard(&fresh), 1.0);
}
