use std::collections::HashMap;

use uuid::Uuid;

use super::{
	Candidate, FusedResult, FusionAlgorithm, PortHit, PortLabel, cmp_f32_desc, rank_asc,
	reassign_ranks,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FusionParams {
	pub rrf_k: f32,
	pub dense_weight: f32,
	pub sparse_weight: f32,
}
impl FusionParams {
	pub fn from_config(cfg: &sift_config::Fusion) -> Self {
		Self { rrf_k: cfg.rrf_k, dense_weight: cfg.dense_weight, sparse_weight: cfg.sparse_weight }
	}

	fn weight(&self, port: PortLabel) -> f32 {
		match port {
			PortLabel::Dense => self.dense_weight,
			PortLabel::Sparse => self.sparse_weight,
		}
	}
}
impl Default for FusionParams {
	fn default() -> Self {
		Self::from_config(&sift_config::Fusion::default())
	}
}

/// The ranked answer of one port that responded.
#[derive(Clone, Debug)]
pub struct PortList {
	pub port: PortLabel,
	pub candidates: Vec<Candidate>,
}

pub fn rrf_contribution(k: f32, rank: u32) -> f32 {
	1.0 / (k + rank as f32)
}

/// Keeps each segment once at its best rank, then orders by rank.
pub fn dedup_best_rank(candidates: Vec<Candidate>) -> Vec<Candidate> {
	let mut best: HashMap<Uuid, Candidate> = HashMap::with_capacity(candidates.len());

	for candidate in candidates {
		match best.get(&candidate.segment_id) {
			Some(existing) if existing.rank <= candidate.rank => {},
			_ => {
				best.insert(candidate.segment_id, candidate);
			},
		}
	}

	let mut out: Vec<Candidate> = best.into_values().collect();

	out.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.segment_id.cmp(&b.segment_id)));

	out
}

/// Merges port lists into at most `limit` results ordered by combined score.
///
/// With a single list the port's ranking passes through unchanged and only the scores are
/// rewritten. Results carry 1-based ranks and non-increasing scores.
pub fn fuse(
	lists: Vec<PortList>,
	algorithm: FusionAlgorithm,
	params: &FusionParams,
	limit: usize,
) -> Vec<FusedResult> {
	if limit == 0 {
		return Vec::new();
	}

	let lists: Vec<PortList> = lists
		.into_iter()
		.map(|list| PortList { port: list.port, candidates: dedup_best_rank(list.candidates) })
		.collect();
	let single_source = lists.len() == 1;
	let weights = normalized_weights(&lists, params);
	let mut merged: HashMap<Uuid, FusedResult> = HashMap::new();

	for list in &lists {
		let weight = weights.get(&list.port).copied().unwrap_or(0.0);

		for candidate in &list.candidates {
			let contribution = match algorithm {
				FusionAlgorithm::Rrf => rrf_contribution(params.rrf_k, candidate.rank),
				FusionAlgorithm::Weighted => weight * unit_score(candidate.score),
			};
			let hit = PortHit { rank: candidate.rank, score: candidate.score };
			let entry =
				merged.entry(candidate.segment_id).or_insert_with(|| empty_result(candidate));

			entry.combined_score += contribution;
			entry.ports.push(list.port);

			match list.port {
				PortLabel::Dense => entry.dense = Some(hit),
				PortLabel::Sparse => entry.sparse = Some(hit),
			}
		}
	}

	let mut out: Vec<FusedResult> = merged.into_values().collect();

	for result in &mut out {
		result.ports.sort();
		result.ports.dedup();

		if algorithm == FusionAlgorithm::Weighted {
			result.combined_score = result.combined_score.clamp(0.0, 1.0);
		}
	}

	if single_source {
		let port = lists[0].port;

		out.sort_by(|a, b| {
			rank_asc(a.hit(port).map(|hit| hit.rank), b.hit(port).map(|hit| hit.rank))
				.then_with(|| a.segment_id.cmp(&b.segment_id))
		});
	} else {
		out.sort_by(|a, b| {
			cmp_f32_desc(a.combined_score, b.combined_score)
				.then_with(|| {
					rank_asc(
						a.dense.map(|hit| hit.rank),
						b.dense.map(|hit| hit.rank),
					)
				})
				.then_with(|| a.segment_id.cmp(&b.segment_id))
		});
	}

	out.truncate(limit);
	reassign_ranks(&mut out);

	out
}

/// Port scores outside `[0, 1]` are clamped; NaN counts as zero.
fn unit_score(score: f32) -> f32 {
	if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) }
}

/// Configured weights rescaled to sum to one over the ports that responded.
fn normalized_weights(lists: &[PortList], params: &FusionParams) -> HashMap<PortLabel, f32> {
	let total: f32 = lists.iter().map(|list| params.weight(list.port).max(0.0)).sum();

	lists
		.iter()
		.map(|list| {
			let weight = if total > 0.0 {
				params.weight(list.port).max(0.0) / total
			} else {
				1.0 / lists.len() as f32
			};

			(list.port, weight)
		})
		.collect()
}

fn empty_result(candidate: &Candidate) -> FusedResult {
	FusedResult {
		segment_id: candidate.segment_id,
		doc_id: candidate.doc_id,
		text: candidate.text.clone(),
		combined_score: 0.0,
		rank: 0,
		ports: Vec::with_capacity(2),
		dense: None,
		sparse: None,
		snippet: None,
		tags: Vec::new(),
		rerank_score: None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn id(n: u128) -> Uuid {
		Uuid::from_u128(n)
	}

	fn candidate(port: PortLabel, segment: u128, rank: u32, score: f32) -> Candidate {
		Candidate {
			segment_id: id(segment),
			doc_id: id(1_000 + segment),
			text: format!("segment {segment}"),
			score,
			port,
			rank,
		}
	}

	fn list(port: PortLabel, segments: &[u128]) -> PortList {
		let candidates = segments
			.iter()
			.enumerate()
			.map(|(idx, segment)| candidate(port, *segment, idx as u32 + 1, 1.0 - idx as f32 * 0.1))
			.collect();

		PortList { port, candidates }
	}

	fn order(results: &[FusedResult]) -> Vec<Uuid> {
		results.iter().map(|result| result.segment_id).collect()
	}

	const A: u128 = 1;
	const B: u128 = 2;
	const C: u128 = 3;
	const D: u128 = 4;

	#[test]
	fn rrf_orders_overlapping_lists() {
		let fused = fuse(
			vec![list(PortLabel::Dense, &[A, B, C]), list(PortLabel::Sparse, &[B, D, A])],
			FusionAlgorithm::Rrf,
			&FusionParams::default(),
			10,
		);

		assert_eq!(order(&fused), vec![id(B), id(A), id(D), id(C)]);
		assert_eq!(fused[0].ports, vec![PortLabel::Dense, PortLabel::Sparse]);
		assert_eq!(fused[2].ports, vec![PortLabel::Sparse]);
		assert_eq!(fused[3].ports, vec![PortLabel::Dense]);
		assert!((fused[1].combined_score - (1.0 / 61.0 + 1.0 / 63.0)).abs() < 1e-6);
		assert_eq!(fused.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
	}

	#[test]
	fn rrf_score_sums_both_ranks_and_beats_single_list() {
		let k = 60.0;

		for (r1, r2) in [(1, 1), (1, 7), (4, 2), (9, 9)] {
			let mut dense = list(PortLabel::Dense, &[]);
			let mut sparse = list(PortLabel::Sparse, &[]);

			dense.candidates.push(candidate(PortLabel::Dense, A, r1, 0.5));
			sparse.candidates.push(candidate(PortLabel::Sparse, A, r2, 0.5));
			sparse.candidates.push(candidate(PortLabel::Sparse, B, r1.min(r2), 0.5));

			let fused = fuse(vec![dense, sparse], FusionAlgorithm::Rrf, &FusionParams::default(), 10);
			let both = fused.iter().find(|r| r.segment_id == id(A)).expect("missing A");
			let single = fused.iter().find(|r| r.segment_id == id(B)).expect("missing B");
			let expected = 1.0 / (k + r1 as f32) + 1.0 / (k + r2 as f32);

			assert!((both.combined_score - expected).abs() < 1e-6, "{r1}/{r2}");
			assert!(both.combined_score > single.combined_score, "{r1}/{r2}");
		}
	}

	#[test]
	fn duplicate_ids_within_one_port_keep_best_rank() {
		let dense = PortList {
			port: PortLabel::Dense,
			candidates: vec![
				candidate(PortLabel::Dense, A, 3, 0.2),
				candidate(PortLabel::Dense, B, 2, 0.4),
				candidate(PortLabel::Dense, A, 1, 0.9),
				candidate(PortLabel::Dense, A, 4, 0.1),
			],
		};
		let sparse = PortList {
			port: PortLabel::Sparse,
			candidates: vec![
				candidate(PortLabel::Sparse, B, 1, 7.0),
				candidate(PortLabel::Sparse, B, 2, 6.0),
			],
		};

		for algorithm in [FusionAlgorithm::Rrf, FusionAlgorithm::Weighted] {
			let fused =
				fuse(vec![dense.clone(), sparse.clone()], algorithm, &FusionParams::default(), 10);
			let mut ids = order(&fused);

			ids.sort();
			ids.dedup();

			let best_a = fused.iter().find(|r| r.segment_id == id(A)).and_then(|r| r.dense);

			assert_eq!(ids.len(), fused.len());
			assert_eq!(best_a.map(|hit| hit.rank), Some(1));
		}
	}

	#[test]
	fn weighted_scores_stay_in_unit_range() {
		let mut dense = list(PortLabel::Dense, &[]);
		let mut sparse = list(PortLabel::Sparse, &[]);
		let scores = [1.0, 0.97, 0.5, 0.5, 0.25, 0.0];

		for (idx, score) in scores.iter().enumerate() {
			dense.candidates.push(candidate(PortLabel::Dense, idx as u128, idx as u32 + 1, *score));
			sparse.candidates.push(candidate(
				PortLabel::Sparse,
				(idx as u128) * 2,
				idx as u32 + 1,
				*score,
			));
		}

		for (dense_weight, sparse_weight) in [(0.5, 0.5), (0.9, 0.1), (0.0, 1.0)] {
			let params = FusionParams { rrf_k: 60.0, dense_weight, sparse_weight };
			let fused =
				fuse(vec![dense.clone(), sparse.clone()], FusionAlgorithm::Weighted, &params, 20);

			for result in &fused {
				assert!((0.0..=1.0).contains(&result.combined_score), "{result:?}");
			}
		}
	}

	#[test]
	fn weighted_clamps_out_of_range_port_scores() {
		let dense = PortList {
			port: PortLabel::Dense,
			candidates: vec![candidate(PortLabel::Dense, A, 1, 14.5)],
		};
		let sparse = PortList {
			port: PortLabel::Sparse,
			candidates: vec![
				candidate(PortLabel::Sparse, A, 1, -3.0),
				candidate(PortLabel::Sparse, B, 2, f32::NAN),
			],
		};
		let fused = fuse(vec![dense, sparse], FusionAlgorithm::Weighted, &FusionParams::default(), 10);

		assert_eq!(fused[0].segment_id, id(A));
		assert!((fused[0].combined_score - 0.5).abs() < 1e-6);
		assert_eq!(fused[1].combined_score, 0.0);
	}

	#[test]
	fn single_list_passes_through_in_port_order() {
		let sparse = PortList {
			port: PortLabel::Sparse,
			candidates: vec![
				candidate(PortLabel::Sparse, C, 1, 0.4),
				candidate(PortLabel::Sparse, A, 2, 0.9),
				candidate(PortLabel::Sparse, B, 3, 0.1),
			],
		};

		for algorithm in [FusionAlgorithm::Rrf, FusionAlgorithm::Weighted] {
			let fused = fuse(vec![sparse.clone()], algorithm, &FusionParams::default(), 10);

			assert_eq!(order(&fused), vec![id(C), id(A), id(B)]);

			for pair in fused.windows(2) {
				assert!(pair[0].combined_score >= pair[1].combined_score);
			}
		}
	}

	#[test]
	fn equal_scores_break_on_dense_rank_then_id() {
		let fused = fuse(
			vec![list(PortLabel::Dense, &[A, D]), list(PortLabel::Sparse, &[C, B])],
			FusionAlgorithm::Rrf,
			&FusionParams::default(),
			10,
		);

		// A and C tie at rank 1, D and B tie at rank 2; the dense side wins each tie.
		assert_eq!(order(&fused), vec![id(A), id(C), id(D), id(B)]);
	}

	#[test]
	fn fusion_is_deterministic() {
		let lists = || vec![list(PortLabel::Dense, &[A, B, C]), list(PortLabel::Sparse, &[B, D, A])];
		let first = fuse(lists(), FusionAlgorithm::Rrf, &FusionParams::default(), 10);
		let second = fuse(lists(), FusionAlgorithm::Rrf, &FusionParams::default(), 10);

		assert_eq!(
			serde_json::to_vec(&first).expect("encode"),
			serde_json::to_vec(&second).expect("encode")
		);
	}

	#[test]
	fn output_is_truncated_to_limit() {
		let fused = fuse(
			vec![list(PortLabel::Dense, &[A, B, C]), list(PortLabel::Sparse, &[B, D, A])],
			FusionAlgorithm::Rrf,
			&FusionParams::default(),
			2,
		);

		assert_eq!(order(&fused), vec![id(B), id(A)]);
		assert!(fuse(Vec::new(), FusionAlgorithm::Rrf, &FusionParams::default(), 5).is_empty());
	}
}
