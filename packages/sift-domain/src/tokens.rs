use std::cmp::Ordering;

use unicode_segmentation::UnicodeSegmentation;

/// Sorted, de-duplicated word tokens of a normalized question.
///
/// Encodes as a plain array. Decoding goes through `from_tokens`, so stored lists in any
/// order still satisfy the invariant `jaccard` walks on.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct TokenSet(Vec<String>);
impl TokenSet {
	pub fn from_normalized(normalized: &str) -> Self {
		let mut tokens: Vec<String> = normalized
			.unicode_words()
			.map(|word| word.chars().flat_map(char::to_lowercase).collect())
			.collect();

		tokens.sort();
		tokens.dedup();

		Self(tokens)
	}

	/// Rebuilds a set from stored tokens, restoring the sorted and unique invariant.
	pub fn from_tokens(tokens: Vec<String>) -> Self {
		let mut tokens = tokens;

		tokens.sort();
		tokens.dedup();

		Self(tokens)
	}

	pub fn as_slice(&self) -> &[String] {
		&self.0
	}

	pub fn into_inner(self) -> Vec<String> {
		self.0
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn contains(&self, token: &str) -> bool {
		self.0.binary_search_by(|probe| probe.as_str().cmp(token)).is_ok()
	}

	pub fn intersection_len(&self, other: &Self) -> usize {
		let (mut left, mut right) = (0, 0);
		let mut shared = 0;

		while left < self.0.len() && right < other.0.len() {
			match self.0[left].cmp(&other.0[right]) {
				Ordering::Less => left += 1,
				Ordering::Greater => right += 1,
				Ordering::Equal => {
					shared += 1;
					left += 1;
					right += 1;
				},
			}
		}

		shared
	}

	/// `|a ∩ b| / |a ∪ b|`. Two empty sets share nothing and score zero.
	pub fn jaccard(&self, other: &Self) -> f32 {
		let shared = self.intersection_len(other);
		let union = self.0.len() + other.0.len() - shared;

		if union == 0 {
			return 0.0;
		}

		shared as f32 / union as f32
	}
}

impl From<Vec<String>> for TokenSet {
	fn from(tokens: Vec<String>) -> Self {
		Self::from_tokens(tokens)
	}
}

impl From<TokenSet> for Vec<String> {
	fn from(tokens: TokenSet) -> Self {
		tokens.0
	}
}
