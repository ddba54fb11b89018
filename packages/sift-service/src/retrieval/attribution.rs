use super::{DominantPort, FusedResult, PortLabel};

/// Attributes the top `window` results to the port set that matched them.
///
/// Both-port matches count as `hybrid`. A tie for the plurality reports `equal`; an empty list
/// reports `none`.
pub fn dominant_port(results: &[FusedResult], window: usize) -> DominantPort {
	let mut hybrid = 0_usize;
	let mut dense = 0_usize;
	let mut sparse = 0_usize;

	for result in results.iter().take(window) {
		let has_dense = result.ports.contains(&PortLabel::Dense);
		let has_sparse = result.ports.contains(&PortLabel::Sparse);

		match (has_dense, has_sparse) {
			(true, true) => hybrid += 1,
			(true, false) => dense += 1,
			(false, true) => sparse += 1,
			(false, false) => {},
		}
	}

	let counts =
		[(DominantPort::Hybrid, hybrid), (DominantPort::Dense, dense), (DominantPort::Sparse, sparse)];
	let best = counts.iter().map(|(_, count)| *count).max().unwrap_or(0);

	if best == 0 {
		return DominantPort::None;
	}

	let mut leaders = counts.iter().filter(|(_, count)| *count == best);

	match (leaders.next(), leaders.next()) {
		(Some((label, _)), None) => *label,
		_ => DominantPort::Equal,
	}
}
